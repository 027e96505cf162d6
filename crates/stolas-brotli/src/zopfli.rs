//! Optimal-parse ("Zopfli") backward-reference search.
//!
//! Dynamic programming over a node per input byte: `nodes[i]` holds the
//! cheapest known way to arrive at byte `i`, where arriving means "a
//! command ends here". Matches are enumerated exhaustively by the
//! binary-tree hasher; costs come from a histogram model that is seeded
//! from per-byte literal estimates and, at the highest quality, re-derived
//! from the first pass's own commands.

use crate::command::Command;
use crate::constants::NUM_DISTANCE_SHORT_CODES;
use crate::dictionary::EncoderDictionary;
use crate::fast_log::fast_log2;
use crate::hash::binary_tree::{BackwardMatch, BinaryTreeHasher, MAX_NUM_MATCHES};
use crate::histogram::{HistogramCommand, HistogramLiteral};
use crate::literal_cost::estimate_bit_costs_for_literals;
use crate::params::EncoderParams;
use crate::prefix::{
    combine_length_codes, get_copy_length_code, get_insert_length_code, prefix_encode_copy_distance,
    K_COPY_EXTRA, K_INS_EXTRA,
};

const K_INFINITY: f32 = 1.7e38;

/// Skip-ahead step applied after very long copies.
const LONG_COPY_QUICK_STEP: usize = 16384;

/// Which distance-cache slot each of the 16 short codes selects.
const K_DISTANCE_CACHE_INDEX: [usize; 16] = [0, 1, 2, 3, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1];
/// The delta each short code applies to the selected cache entry.
const K_DISTANCE_CACHE_OFFSET: [i32; 16] = [0, 0, 0, 0, -1, 1, -2, 2, -3, 3, -1, 1, -2, 2, -3, 3];

/// One node of the shortest-path array; the three coded sub-fields stay
/// bit-packed for cache density.
#[derive(Debug, Clone, Copy)]
pub struct ZopfliNode {
    /// Copy length (25 bits) plus length-code modifier (7 bits).
    length: u32,
    /// Real copy distance.
    distance: u32,
    /// Distance short code + 1 (5 bits) and insert length (27 bits).
    dcode_insert_length: u32,
    /// During search: cost; after search: next-command length; always:
    /// shortcut to the last command with a real distance.
    pub cost: f32,
    pub next: u32,
    pub shortcut: u32,
}

impl ZopfliNode {
    fn stub() -> Self {
        ZopfliNode {
            length: 1,
            distance: 0,
            dcode_insert_length: 0,
            cost: K_INFINITY,
            next: 0,
            shortcut: 0,
        }
    }

    #[inline]
    pub fn copy_length(&self) -> usize {
        (self.length & 0x01FF_FFFF) as usize
    }

    #[inline]
    pub fn length_code(&self) -> usize {
        let modifier = (self.length >> 25) as usize;
        self.copy_length() + 9 - modifier
    }

    #[inline]
    pub fn copy_distance(&self) -> usize {
        self.distance as usize
    }

    #[inline]
    pub fn insert_length(&self) -> usize {
        (self.dcode_insert_length & 0x07FF_FFFF) as usize
    }

    #[inline]
    pub fn distance_code(&self) -> usize {
        let short_code = (self.dcode_insert_length >> 27) as usize;
        if short_code == 0 {
            self.copy_distance() + NUM_DISTANCE_SHORT_CODES - 1
        } else {
            short_code - 1
        }
    }

    #[inline]
    pub fn command_length(&self) -> usize {
        self.copy_length() + self.insert_length()
    }
}

fn init_zopfli_nodes(array: &mut Vec<ZopfliNode>, length: usize) {
    array.clear();
    array.resize(length, ZopfliNode::stub());
}

/// Maintains the node-array invariant: nodes are only improved, and every
/// finite node is reachable from node 0.
#[allow(clippy::too_many_arguments)]
fn update_zopfli_node(
    nodes: &mut [ZopfliNode],
    pos: usize,
    start_pos: usize,
    len: usize,
    len_code: usize,
    dist: usize,
    short_code: usize,
    cost: f32,
) {
    let next = &mut nodes[pos + len];
    next.length = (len | (len + 9 - len_code) << 25) as u32;
    next.distance = dist as u32;
    next.dcode_insert_length = ((short_code << 27) | (pos - start_pos)) as u32;
    next.cost = cost;
}

/// Histogram-based cost model.
pub struct ZopfliCostModel {
    cost_cmd: Vec<f32>,
    cost_dist: Vec<f32>,
    distance_histogram_size: usize,
    literal_costs: Vec<f32>,
    min_cost_cmd: f32,
    num_bytes: usize,
}

impl ZopfliCostModel {
    pub fn new(params: &EncoderParams, num_bytes: usize) -> Self {
        let distance_histogram_size =
            (params.dist.alphabet_size as usize).min(crate::constants::NUM_DISTANCE_SYMBOLS);
        ZopfliCostModel {
            cost_cmd: vec![0.0; crate::constants::NUM_COMMAND_SYMBOLS],
            cost_dist: vec![0.0; params.dist.alphabet_size as usize],
            distance_histogram_size,
            literal_costs: vec![0.0; num_bytes + 2],
            min_cost_cmd: 0.0,
            num_bytes,
        }
    }

    /// First-pass model: UTF-8-aware per-byte literal estimates and
    /// rank-based priors for command and distance symbols.
    pub fn set_from_literal_costs(&mut self, position: usize, ringbuffer: &[u8], ringbuffer_mask: usize) {
        let num_bytes = self.num_bytes;
        estimate_bit_costs_for_literals(
            position,
            num_bytes,
            ringbuffer_mask,
            ringbuffer,
            &mut self.literal_costs[1..],
        );
        self.literal_costs[0] = 0.0;
        let mut literal_carry = 0.0f32;
        for i in 0..num_bytes {
            literal_carry += self.literal_costs[i + 1];
            self.literal_costs[i + 1] = self.literal_costs[i] + literal_carry;
            literal_carry -= self.literal_costs[i + 1] - self.literal_costs[i];
        }
        for (i, c) in self.cost_cmd.iter_mut().enumerate() {
            *c = fast_log2(11 + i as u64) as f32;
        }
        for (i, c) in self.cost_dist[..self.distance_histogram_size]
            .iter_mut()
            .enumerate()
        {
            *c = fast_log2(20 + i as u64) as f32;
        }
        self.min_cost_cmd = fast_log2(11) as f32;
    }

    /// Second-pass model: costs from the histograms implied by the first
    /// pass's commands.
    pub fn set_from_commands(
        &mut self,
        position: usize,
        ringbuffer: &[u8],
        ringbuffer_mask: usize,
        commands: &[Command],
        last_insert_len: usize,
    ) {
        let mut histogram_literal = HistogramLiteral::new();
        let mut histogram_cmd = HistogramCommand::new();
        let mut histogram_dist = vec![0u32; self.distance_histogram_size];
        let mut cost_literal = [0.0f32; crate::constants::NUM_LITERAL_SYMBOLS];
        let mut pos = position.wrapping_sub(last_insert_len);

        for cmd in commands {
            let inslength = cmd.insert_len as usize;
            let copylength = cmd.copy_len() as usize;
            let distcode = (cmd.dist_prefix & 0x3FF) as usize;
            let cmdcode = cmd.cmd_prefix as usize;

            histogram_cmd.add(cmdcode);
            if cmdcode >= 128 {
                histogram_dist[distcode] += 1;
            }
            for j in 0..inslength {
                histogram_literal.add(ringbuffer[(pos + j) & ringbuffer_mask] as usize);
            }
            pos += inslength + copylength;
        }

        set_cost(&histogram_literal.data, true, &mut cost_literal);
        set_cost(&histogram_cmd.data, false, &mut self.cost_cmd);
        set_cost(&histogram_dist, false, &mut self.cost_dist[..self.distance_histogram_size]);

        self.min_cost_cmd = self
            .cost_cmd
            .iter()
            .fold(K_INFINITY, |acc, &c| acc.min(c));

        let num_bytes = self.num_bytes;
        self.literal_costs[0] = 0.0;
        let mut literal_carry = 0.0f32;
        for i in 0..num_bytes {
            literal_carry += cost_literal[ringbuffer[(position + i) & ringbuffer_mask] as usize];
            self.literal_costs[i + 1] = self.literal_costs[i] + literal_carry;
            literal_carry -= self.literal_costs[i + 1] - self.literal_costs[i];
        }
    }

    #[inline]
    fn command_cost(&self, cmdcode: u16) -> f32 {
        self.cost_cmd[cmdcode as usize]
    }

    #[inline]
    fn distance_cost(&self, distcode: usize) -> f32 {
        self.cost_dist[distcode]
    }

    #[inline]
    fn literal_costs(&self, from: usize, to: usize) -> f32 {
        self.literal_costs[to] - self.literal_costs[from]
    }

    #[inline]
    fn min_cost_cmd(&self) -> f32 {
        self.min_cost_cmd
    }
}

/// Shannon costs with a fallback for absent symbols derived from the
/// total missing mass; every cost is at least one bit.
fn set_cost(histogram: &[u32], literal_histogram: bool, cost: &mut [f32]) {
    let mut sum = 0usize;
    for &h in histogram {
        sum += h as usize;
    }
    let log2sum = fast_log2(sum as u64) as f32;
    let mut missing_symbol_sum = sum;
    if !literal_histogram {
        for &h in histogram {
            if h == 0 {
                missing_symbol_sum += 1;
            }
        }
    }
    let missing_symbol_cost = fast_log2(missing_symbol_sum as u64) as f32 + 2.0;
    for (i, c) in cost.iter_mut().enumerate() {
        if histogram[i] == 0 {
            *c = missing_symbol_cost;
            continue;
        }
        // Shannon bits for this symbol.
        *c = log2sum - fast_log2(u64::from(histogram[i])) as f32;
        // Cannot be coded with fewer than 1 bit.
        if *c < 1.0 {
            *c = 1.0;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PosData {
    pos: usize,
    distance_cache: [i32; 4],
    costdiff: f32,
    cost: f32,
}

/// Holds the eight start positions with the smallest cost difference.
struct StartPosQueue {
    q: [PosData; 8],
    idx: usize,
}

impl StartPosQueue {
    fn new() -> Self {
        StartPosQueue {
            q: [PosData::default(); 8],
            idx: 0,
        }
    }

    fn size(&self) -> usize {
        self.idx.min(8)
    }

    fn push(&mut self, posdata: PosData) {
        let mut offset = !self.idx & 7;
        self.idx += 1;
        let queue_size = self.size();
        self.q[offset] = posdata;
        // Restore sorted order; at most queue_size - 1 swaps.
        for _ in 1..queue_size {
            if self.q[offset & 7].costdiff > self.q[(offset + 1) & 7].costdiff {
                self.q.swap(offset & 7, (offset + 1) & 7);
            }
            offset += 1;
        }
    }

    fn at(&self, k: usize) -> &PosData {
        &self.q[k.wrapping_sub(self.idx) & 7]
    }
}

/// Minimum copy length that can still improve any future node.
fn compute_minimum_copy_length(
    start_cost: f32,
    nodes: &[ZopfliNode],
    num_bytes: usize,
    pos: usize,
) -> usize {
    let mut min_cost = start_cost;
    let mut len = 2usize;
    let mut next_len_bucket = 4usize;
    let mut next_len_offset = 10usize;
    while pos + len <= num_bytes && nodes[pos + len].cost <= min_cost {
        // Already reached (pos + len) at no more than the minimum possible
        // cost from here, so shorter lengths cannot help.
        len += 1;
        if len == next_len_offset {
            // Entering the next copy-length-code bucket costs one more
            // extra bit.
            min_cost += 1.0;
            next_len_offset += next_len_bucket;
            next_len_bucket *= 2;
        }
    }
    len
}

/// Distance shortcut of the node at `pos`: the last position at which a
/// command with a real (ring-advancing) distance ended.
fn compute_distance_shortcut(
    block_start: usize,
    pos: usize,
    max_backward_limit: usize,
    gap: usize,
    nodes: &[ZopfliNode],
) -> u32 {
    let clen = nodes[pos].copy_length();
    let ilen = nodes[pos].insert_length();
    let dist = nodes[pos].copy_distance();
    // Dictionary references and distance code 0 do not update the last
    // distances.
    if pos == 0 {
        0
    } else if dist + clen <= block_start + pos + gap
        && dist <= max_backward_limit + gap
        && nodes[pos].distance_code() > 0
    {
        pos as u32
    } else {
        nodes[pos - clen - ilen].shortcut
    }
}

/// Last four distinct distances on the shortest path ending at `pos`.
fn compute_distance_cache(
    pos: usize,
    starting_dist_cache: &[i32],
    nodes: &[ZopfliNode],
    dist_cache: &mut [i32; 4],
) {
    let mut idx = 0usize;
    let mut p = nodes[pos].shortcut as usize;
    while idx < 4 && p > 0 {
        let ilen = nodes[p].insert_length();
        let clen = nodes[p].copy_length();
        let dist = nodes[p].copy_distance();
        dist_cache[idx] = dist as i32;
        idx += 1;
        // The array invariant guarantees p >= clen + ilen >= 2.
        p = nodes[p - clen - ilen].shortcut as usize;
    }
    let mut fill = 0;
    while idx < 4 {
        dist_cache[idx] = starting_dist_cache[fill];
        fill += 1;
        idx += 1;
    }
}

/// Pushes `pos` into the queue if it is a plausible command start.
fn evaluate_node(
    block_start: usize,
    pos: usize,
    max_backward_limit: usize,
    gap: usize,
    starting_dist_cache: &[i32],
    model: &ZopfliCostModel,
    queue: &mut StartPosQueue,
    nodes: &mut [ZopfliNode],
) {
    let node_cost = nodes[pos].cost;
    nodes[pos].shortcut = compute_distance_shortcut(block_start, pos, max_backward_limit, gap, nodes);
    if node_cost <= model.literal_costs(0, pos) {
        let mut posdata = PosData {
            pos,
            cost: node_cost,
            costdiff: node_cost - model.literal_costs(0, pos),
            distance_cache: [0; 4],
        };
        compute_distance_cache(pos, starting_dist_cache, nodes, &mut posdata.distance_cache);
        queue.push(posdata);
    }
}

/// Relaxes all nodes reachable from the queued start positions with the
/// matches found at `pos`. Returns the longest accepted copy length.
#[allow(clippy::too_many_arguments)]
fn update_nodes(
    num_bytes: usize,
    block_start: usize,
    pos: usize,
    ringbuffer: &[u8],
    ringbuffer_mask: usize,
    params: &EncoderParams,
    max_backward_limit: usize,
    starting_dist_cache: &[i32],
    num_matches: usize,
    matches: &[BackwardMatch],
    model: &ZopfliCostModel,
    queue: &mut StartPosQueue,
    nodes: &mut [ZopfliNode],
) -> usize {
    let cur_ix = block_start + pos;
    let cur_ix_masked = cur_ix & ringbuffer_mask;
    let max_distance = cur_ix.min(max_backward_limit);
    let max_len = num_bytes - pos;
    let max_zopfli_len = params.max_zopfli_len();
    let max_iters = params.max_zopfli_candidates();
    let mut result = 0usize;
    let gap = 0usize;

    evaluate_node(
        block_start,
        pos,
        max_backward_limit,
        gap,
        starting_dist_cache,
        model,
        queue,
        nodes,
    );

    let min_len = {
        let posdata = queue.at(0);
        let min_cost =
            posdata.cost + model.min_cost_cmd() + model.literal_costs(posdata.pos, pos);
        compute_minimum_copy_length(min_cost, nodes, num_bytes, pos)
    };

    // Walk the start positions in order of increasing cost difference.
    for k in 0..max_iters.min(queue.size()) {
        let posdata = *queue.at(k);
        let start = posdata.pos;
        let inscode = get_insert_length_code(pos - start);
        let start_costdiff = posdata.costdiff;
        let base_cost = start_costdiff
            + K_INS_EXTRA[inscode as usize] as f32
            + model.literal_costs(0, pos);
        let mut best_len = min_len - 1;

        // First, the four last distances plus their near misses.
        let mut j = 0usize;
        while j < NUM_DISTANCE_SHORT_CODES && best_len < max_len {
            let idx = K_DISTANCE_CACHE_INDEX[j];
            let backward =
                (posdata.distance_cache[idx] + K_DISTANCE_CACHE_OFFSET[j]) as usize;
            let prev_ix = cur_ix.wrapping_sub(backward);
            if cur_ix_masked + best_len > ringbuffer_mask {
                break;
            }
            let continuation = ringbuffer[cur_ix_masked + best_len];
            if backward > max_distance + gap {
                // Word dictionary -> ignore.
                j += 1;
                continue;
            }
            if backward > max_distance || prev_ix >= cur_ix {
                j += 1;
                continue;
            }
            let prev_ix = prev_ix & ringbuffer_mask;
            if prev_ix + best_len > ringbuffer_mask
                || continuation != ringbuffer[prev_ix + best_len]
            {
                j += 1;
                continue;
            }
            let len = crate::hash::find_match_length_with_limit(
                &ringbuffer[prev_ix..],
                &ringbuffer[cur_ix_masked..],
                max_len,
            );
            let dist_cost = base_cost + model.distance_cost(j);
            for l in best_len + 1..=len {
                let copycode = get_copy_length_code(l);
                let cmdcode = combine_length_codes(inscode, copycode, j == 0);
                let base = if cmdcode < 128 { base_cost } else { dist_cost };
                let cost = base
                    + K_COPY_EXTRA[copycode as usize] as f32
                    + model.command_cost(cmdcode);
                if cost < nodes[pos + l].cost {
                    update_zopfli_node(nodes, pos, start, l, l, backward, j + 1, cost);
                    result = result.max(l);
                }
                best_len = l;
            }
            j += 1;
        }

        // At higher iterations only the new last-distance matches help.
        if k >= 2 {
            continue;
        }

        {
            let mut len = min_len;
            for match_ in &matches[..num_matches] {
                let dist = match_.distance as usize;
                let is_dictionary_match = dist > max_distance + gap;
                // All last-distance matches were tried above, so the plain
                // distance code is correct here.
                let dist_code = dist + NUM_DISTANCE_SHORT_CODES - 1;
                let (dist_symbol, _) = prefix_encode_copy_distance(
                    dist_code,
                    params.dist.num_direct_distance_codes as usize,
                    params.dist.distance_postfix_bits,
                );
                let distnumextra = u32::from(dist_symbol) >> 10;
                let dist_cost = base_cost
                    + distnumextra as f32
                    + model.distance_cost((dist_symbol & 0x3FF) as usize);

                // Try all copy lengths up to the match length; dictionary
                // references and very long matches try only the maximum.
                let max_match_len = match_.length();
                if len < max_match_len && (is_dictionary_match || max_match_len > max_zopfli_len) {
                    len = max_match_len;
                }
                while len <= max_match_len {
                    let len_code = if is_dictionary_match {
                        match_.length_code()
                    } else {
                        len
                    };
                    let copycode = get_copy_length_code(len_code);
                    let cmdcode = combine_length_codes(inscode, copycode, false);
                    let cost = dist_cost
                        + K_COPY_EXTRA[copycode as usize] as f32
                        + model.command_cost(cmdcode);
                    if cost < nodes[pos + len].cost {
                        update_zopfli_node(nodes, pos, start, len, len_code, dist, 0, cost);
                        result = result.max(len);
                    }
                    len += 1;
                }
            }
        }
    }
    result
}

fn compute_shortest_path_from_nodes(num_bytes: usize, nodes: &mut [ZopfliNode]) -> usize {
    let mut index = num_bytes;
    let mut num_commands = 0usize;
    while nodes[index].insert_length() == 0 && nodes[index].length == 1 {
        index -= 1;
    }
    nodes[index].next = u32::MAX;
    while index != 0 {
        let len = nodes[index].command_length();
        index -= len;
        nodes[index].next = len as u32;
        num_commands += 1;
    }
    num_commands
}

/// Turns the computed shortest path into commands.
#[allow(clippy::too_many_arguments)]
pub fn zopfli_create_commands(
    num_bytes: usize,
    block_start: usize,
    nodes: &[ZopfliNode],
    dist_cache: &mut [i32],
    last_insert_len: &mut usize,
    params: &EncoderParams,
    commands: &mut Vec<Command>,
    num_literals: &mut usize,
) {
    let max_backward_limit = params.max_backward_limit();
    let mut pos = 0usize;
    let mut offset = nodes[0].next;
    let gap = 0usize;
    let mut i = 0usize;
    while offset != u32::MAX {
        let next = &nodes[pos + offset as usize];
        let copy_length = next.copy_length();
        let mut insert_length = next.insert_length();
        pos += insert_length;
        offset = next.next;
        if i == 0 {
            insert_length += *last_insert_len;
            *last_insert_len = 0;
        }
        {
            let distance = next.copy_distance();
            let len_code = next.length_code();
            let max_distance = (block_start + pos).min(max_backward_limit);
            let is_dictionary = distance > max_distance + gap;
            let dist_code = next.distance_code();
            commands.push(Command::new(
                &params.dist,
                insert_length,
                copy_length,
                len_code as i32 - copy_length as i32,
                dist_code,
            ));
            if !is_dictionary && dist_code > 0 {
                dist_cache[3] = dist_cache[2];
                dist_cache[2] = dist_cache[1];
                dist_cache[1] = dist_cache[0];
                dist_cache[0] = distance as i32;
            }
        }
        *num_literals += insert_length;
        pos += copy_length;
        i += 1;
    }
    *last_insert_len += num_bytes - pos;
}

/// One pass of the iterated (quality 11) search with a prepared cost
/// model and pre-enumerated matches.
#[allow(clippy::too_many_arguments)]
fn zopfli_iterate(
    num_bytes: usize,
    position: usize,
    ringbuffer: &[u8],
    ringbuffer_mask: usize,
    params: &EncoderParams,
    gap: usize,
    dist_cache: &[i32],
    model: &ZopfliCostModel,
    num_matches: &[u32],
    matches: &[BackwardMatch],
    nodes: &mut [ZopfliNode],
) -> usize {
    let max_backward_limit = params.max_backward_limit();
    let max_zopfli_len = params.max_zopfli_len();
    let mut queue = StartPosQueue::new();
    let mut cur_match_pos = 0usize;
    nodes[0].length = 0;
    nodes[0].cost = 0.0;
    let mut i = 0usize;
    while i + 3 < num_bytes {
        let mut skip = update_nodes(
            num_bytes,
            position,
            i,
            ringbuffer,
            ringbuffer_mask,
            params,
            max_backward_limit,
            dist_cache,
            num_matches[i] as usize,
            &matches[cur_match_pos..],
            model,
            &mut queue,
            nodes,
        );
        if skip < LONG_COPY_QUICK_STEP {
            skip = 0;
        }
        cur_match_pos += num_matches[i] as usize;
        if num_matches[i] == 1 && matches[cur_match_pos - 1].length() > max_zopfli_len {
            skip = skip.max(matches[cur_match_pos - 1].length());
        }
        if skip > 1 {
            skip -= 1;
            while skip != 0 {
                i += 1;
                if i + 3 >= num_bytes {
                    break;
                }
                evaluate_node(
                    position,
                    i,
                    max_backward_limit,
                    gap,
                    dist_cache,
                    model,
                    &mut queue,
                    nodes,
                );
                cur_match_pos += num_matches[i] as usize;
                skip -= 1;
            }
        }
        i += 1;
    }
    compute_shortest_path_from_nodes(num_bytes, nodes)
}

/// Quality-10 search: one pass with the literal-cost model, matches found
/// on the fly.
#[allow(clippy::too_many_arguments)]
pub fn zopfli_compute_shortest_path(
    num_bytes: usize,
    position: usize,
    ringbuffer: &[u8],
    ringbuffer_mask: usize,
    params: &EncoderParams,
    dictionary: &EncoderDictionary,
    dist_cache: &[i32],
    hasher: &mut BinaryTreeHasher,
    nodes: &mut [ZopfliNode],
) -> usize {
    let max_backward_limit = params.max_backward_limit();
    let max_zopfli_len = params.max_zopfli_len();
    let mut model = ZopfliCostModel::new(params, num_bytes);
    let mut queue = StartPosQueue::new();
    let mut matches: Vec<BackwardMatch> = Vec::with_capacity(2 * (MAX_NUM_MATCHES + 64));
    let store_end = if num_bytes >= hasher.store_lookahead() {
        position + num_bytes - hasher.store_lookahead() + 1
    } else {
        position
    };
    let gap = 0usize;
    nodes[0].length = 0;
    nodes[0].cost = 0.0;
    model.set_from_literal_costs(position, ringbuffer, ringbuffer_mask);
    let mut i = 0usize;
    while i + hasher.hash_type_length() - 1 < num_bytes {
        let pos = position + i;
        let max_distance = pos.min(max_backward_limit);
        matches.clear();
        let mut num_matches = hasher.find_all_matches(
            dictionary,
            ringbuffer,
            ringbuffer_mask,
            pos,
            num_bytes - i,
            max_distance,
            gap,
            params,
            &mut matches,
        );
        if num_matches > 0 && matches[num_matches - 1].length() > max_zopfli_len {
            matches[0] = matches[num_matches - 1];
            num_matches = 1;
        }
        let mut skip = update_nodes(
            num_bytes,
            position,
            i,
            ringbuffer,
            ringbuffer_mask,
            params,
            max_backward_limit,
            dist_cache,
            num_matches,
            &matches,
            &model,
            &mut queue,
            nodes,
        );
        if skip < LONG_COPY_QUICK_STEP {
            skip = 0;
        }
        if num_matches == 1 && matches[0].length() > max_zopfli_len {
            skip = skip.max(matches[0].length());
        }
        if skip > 1 {
            // Add the tail of the long copy to the hasher.
            hasher.store_range(
                ringbuffer,
                ringbuffer_mask,
                pos + 1,
                (pos + skip).min(store_end),
            );
            skip -= 1;
            while skip != 0 {
                i += 1;
                if i + hasher.hash_type_length() - 1 >= num_bytes {
                    break;
                }
                evaluate_node(
                    position,
                    i,
                    max_backward_limit,
                    gap,
                    dist_cache,
                    &model,
                    &mut queue,
                    nodes,
                );
                skip -= 1;
            }
        }
        i += 1;
    }
    compute_shortest_path_from_nodes(num_bytes, nodes)
}

/// Quality-10 driver.
#[allow(clippy::too_many_arguments)]
pub fn create_zopfli_backward_references(
    num_bytes: usize,
    position: usize,
    ringbuffer: &[u8],
    ringbuffer_mask: usize,
    params: &EncoderParams,
    dictionary: &EncoderDictionary,
    hasher: &mut BinaryTreeHasher,
    dist_cache: &mut [i32],
    last_insert_len: &mut usize,
    commands: &mut Vec<Command>,
    num_literals: &mut usize,
) {
    let mut nodes = Vec::new();
    init_zopfli_nodes(&mut nodes, num_bytes + 1);
    zopfli_compute_shortest_path(
        num_bytes,
        position,
        ringbuffer,
        ringbuffer_mask,
        params,
        dictionary,
        dist_cache,
        hasher,
        &mut nodes,
    );
    zopfli_create_commands(
        num_bytes,
        position,
        &nodes,
        dist_cache,
        last_insert_len,
        params,
        commands,
        num_literals,
    );
}

/// Quality-11 driver: enumerate matches once, then run two iterations of
/// the shortest-path search, re-deriving the cost model from the first
/// pass's commands.
#[allow(clippy::too_many_arguments)]
pub fn create_hq_zopfli_backward_references(
    num_bytes: usize,
    position: usize,
    ringbuffer: &[u8],
    ringbuffer_mask: usize,
    params: &EncoderParams,
    dictionary: &EncoderDictionary,
    hasher: &mut BinaryTreeHasher,
    dist_cache: &mut [i32],
    last_insert_len: &mut usize,
    commands: &mut Vec<Command>,
    num_literals: &mut usize,
) {
    let max_backward_limit = params.max_backward_limit();
    let mut num_matches = vec![0u32; num_bytes];
    let mut matches: Vec<BackwardMatch> = Vec::with_capacity(4 * num_bytes.max(1));
    let store_end = if num_bytes >= hasher.store_lookahead() {
        position + num_bytes - hasher.store_lookahead() + 1
    } else {
        position
    };
    let gap = 0usize;

    let mut i = 0usize;
    while i + hasher.hash_type_length() - 1 < num_bytes {
        let pos = position + i;
        let max_distance = pos.min(max_backward_limit);
        let max_length = num_bytes - i;
        let cur_match_pos = matches.len();
        let num_found = hasher.find_all_matches(
            dictionary,
            ringbuffer,
            ringbuffer_mask,
            pos,
            max_length,
            max_distance,
            gap,
            params,
            &mut matches,
        );
        num_matches[i] = num_found as u32;
        if num_found > 0 {
            let match_len = matches[matches.len() - 1].length();
            if match_len > params.max_zopfli_len() {
                // Keep only the longest match and skip ahead.
                let skip = match_len - 1;
                let last = matches[matches.len() - 1];
                matches.truncate(cur_match_pos);
                matches.push(last);
                num_matches[i] = 1;
                hasher.store_range(
                    ringbuffer,
                    ringbuffer_mask,
                    pos + 1,
                    (pos + match_len).min(store_end),
                );
                for nm in num_matches[i + 1..].iter_mut().take(skip) {
                    *nm = 0;
                }
                i += skip;
            }
        }
        i += 1;
    }

    let orig_num_literals = *num_literals;
    let orig_last_insert_len = *last_insert_len;
    let mut orig_dist_cache = [0i32; 4];
    orig_dist_cache.copy_from_slice(&dist_cache[..4]);
    let orig_num_commands = commands.len();
    let mut nodes = Vec::new();
    let mut model = ZopfliCostModel::new(params, num_bytes);
    for i in 0..2 {
        init_zopfli_nodes(&mut nodes, num_bytes + 1);
        if i == 0 {
            model.set_from_literal_costs(position, ringbuffer, ringbuffer_mask);
        } else {
            model.set_from_commands(
                position,
                ringbuffer,
                ringbuffer_mask,
                &commands[orig_num_commands..],
                orig_last_insert_len,
            );
        }
        commands.truncate(orig_num_commands);
        *num_literals = orig_num_literals;
        *last_insert_len = orig_last_insert_len;
        dist_cache[..4].copy_from_slice(&orig_dist_cache);
        zopfli_iterate(
            num_bytes,
            position,
            ringbuffer,
            ringbuffer_mask,
            params,
            gap,
            dist_cache,
            &model,
            &num_matches,
            &matches,
            &mut nodes,
        );
        zopfli_create_commands(
            num_bytes,
            position,
            &nodes,
            dist_cache,
            last_insert_len,
            params,
            commands,
            num_literals,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::get_encoder_dictionary;

    fn hq_params() -> EncoderParams {
        let mut p = EncoderParams {
            quality: 11,
            lgwin: 16,
            ..Default::default()
        };
        p.sanitize();
        p.lgblock = p.compute_lgblock();
        p.choose_distance_params();
        p.choose_hasher();
        p
    }

    fn reconstruct(
        data: &[u8],
        commands: &[Command],
        last_insert_len: usize,
        dist_cache_start: [i32; 4],
    ) -> Vec<u8> {
        // Replays commands against an output buffer; dictionary references
        // are absent in these tests so every distance is in-window.
        let mut out: Vec<u8> = Vec::new();
        let mut pos = 0usize;
        let mut cache = dist_cache_start;
        for cmd in commands {
            for _ in 0..cmd.insert_len {
                out.push(data[pos]);
                pos += 1;
            }
            let copy_len = cmd.copy_len() as usize;
            if copy_len > 0 {
                let dist_code = cmd.restore_distance_code(&DistanceParamsForTest::get());
                let distance = match dist_code {
                    0 => cache[0] as usize,
                    1 => cache[1] as usize,
                    2 => cache[2] as usize,
                    3 => cache[3] as usize,
                    4..=9 => (cache[0] + [0, 0, 0, 0, -1, 1, -2, 2, -3, 3][dist_code as usize] as i32) as usize,
                    10..=15 => (cache[1] + [-1, 1, -2, 2, -3, 3][(dist_code - 10) as usize]) as usize,
                    d => d as usize - 15,
                };
                if dist_code != 0 {
                    cache = [distance as i32, cache[0], cache[1], cache[2]];
                }
                for _ in 0..copy_len {
                    let b = out[out.len() - distance];
                    out.push(b);
                    pos += 1;
                }
            }
        }
        for _ in 0..last_insert_len {
            out.push(data[pos]);
            pos += 1;
        }
        out
    }

    struct DistanceParamsForTest;
    impl DistanceParamsForTest {
        fn get() -> crate::params::DistanceParams {
            crate::params::DistanceParams::new(0, 0, false)
        }
    }

    #[test]
    fn test_hq_commands_reconstruct_input() {
        let mut params = hq_params();
        params.dist = crate::params::DistanceParams::new(0, 0, false);
        let mut data = Vec::new();
        for i in 0..40 {
            data.extend_from_slice(b"a structured line of text ");
            data.push(b'0' + (i % 10) as u8);
            data.push(b'\n');
        }
        data.extend_from_slice(&[0u8; 160]);
        let payload = data.len() - 160;

        let mut hasher = BinaryTreeHasher::new(&params);
        hasher.prepare(true, payload);
        let mut dist_cache = [4i32, 11, 15, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut last_insert_len = 0usize;
        let mut commands = Vec::new();
        let mut num_literals = 0usize;
        create_hq_zopfli_backward_references(
            payload,
            0,
            &data,
            usize::MAX >> 1,
            &params,
            get_encoder_dictionary(),
            &mut hasher,
            &mut dist_cache,
            &mut last_insert_len,
            &mut commands,
            &mut num_literals,
        );
        assert!(!commands.is_empty());
        let covered: usize = commands
            .iter()
            .map(|c| c.insert_len as usize + c.copy_len() as usize)
            .sum::<usize>()
            + last_insert_len;
        assert_eq!(covered, payload);
        let rebuilt = reconstruct(&data, &commands, last_insert_len, [4, 11, 15, 16]);
        assert_eq!(rebuilt, &data[..payload]);
    }

    #[test]
    fn test_node_array_invariant() {
        let mut params = hq_params();
        params.dist = crate::params::DistanceParams::new(0, 0, false);
        let mut data = Vec::new();
        for _ in 0..50 {
            data.extend_from_slice(b"zopfli node invariants! ");
        }
        data.extend_from_slice(&[0u8; 160]);
        let payload = data.len() - 160;
        let mut hasher = BinaryTreeHasher::new(&params);
        hasher.prepare(true, payload);
        let dist_cache = [4i32, 11, 15, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut nodes = Vec::new();
        init_zopfli_nodes(&mut nodes, payload + 1);
        zopfli_compute_shortest_path(
            payload,
            0,
            &data,
            usize::MAX >> 1,
            &params,
            get_encoder_dictionary(),
            &dist_cache,
            &mut hasher,
            &mut nodes,
        );
        // Walk next pointers from node 0: the chain must cover the prefix
        // exactly and terminate.
        let mut pos = 0usize;
        let mut offset = nodes[0].next;
        while offset != u32::MAX {
            let next = &nodes[pos + offset as usize];
            assert!(next.copy_length() >= 2 || next.insert_length() > 0);
            assert!(next.command_length() <= pos + offset as usize);
            pos += next.insert_length() + next.copy_length();
            offset = next.next;
        }
        assert!(pos <= payload);
    }
}
