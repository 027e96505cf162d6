//! Meta-block assembly: block splits, context-aware histograms, and the
//! clustered tree groups plus context maps the serializer stores.

use crate::block_splitter::{split_block, BlockSplit};
use crate::cluster::cluster_histograms;
use crate::command::Command;
use crate::constants::{DISTANCE_CONTEXT_BITS, LITERAL_CONTEXT_BITS};
use crate::context::ContextMode;
use crate::entropy::optimize_huffman_counts_for_rle;
use crate::histogram::{
    build_histograms_with_context, HistogramCommand, HistogramDistance, HistogramLiteral,
};
use crate::params::EncoderParams;

/// Histogram ids must fit in one byte.
const K_MAX_NUMBER_OF_HISTOGRAMS: usize = 256;

/// Everything the serializer needs to write one compressed meta-block.
#[derive(Default)]
pub struct MetaBlockSplit {
    pub literal_split: BlockSplit,
    pub command_split: BlockSplit,
    pub distance_split: BlockSplit,
    /// `(block_type << 6) | context` -> literal tree id.
    pub literal_context_map: Vec<u32>,
    /// `(block_type << 2) | context` -> distance tree id.
    pub distance_context_map: Vec<u32>,
    pub literal_histograms: Vec<HistogramLiteral>,
    pub command_histograms: Vec<HistogramCommand>,
    pub distance_histograms: Vec<HistogramDistance>,
}

/// Builds the full meta-block description: split all three streams, build
/// context-indexed histograms, cluster them into tree groups, and derive
/// the context maps.
#[allow(clippy::too_many_arguments)]
pub fn build_meta_block(
    ringbuffer: &[u8],
    pos: usize,
    mask: usize,
    params: &EncoderParams,
    prev_byte: u8,
    prev_byte2: u8,
    cmds: &[Command],
    literal_context_mode: ContextMode,
    mb: &mut MetaBlockSplit,
) {
    split_block(
        cmds,
        ringbuffer,
        pos,
        mask,
        params,
        &mut mb.literal_split,
        &mut mb.command_split,
        &mut mb.distance_split,
    );

    let use_literal_context = !params.disable_literal_context_modeling;
    let literal_context_multiplier = if use_literal_context {
        1 << LITERAL_CONTEXT_BITS
    } else {
        1
    };
    let literal_context_modes: Option<Vec<ContextMode>> = if use_literal_context {
        Some(vec![literal_context_mode; mb.literal_split.num_types])
    } else {
        None
    };

    let literal_histograms_size = mb.literal_split.num_types * literal_context_multiplier;
    let mut literal_histograms = vec![HistogramLiteral::new(); literal_histograms_size];
    let distance_histograms_size = mb.distance_split.num_types << DISTANCE_CONTEXT_BITS;
    let mut distance_histograms = vec![HistogramDistance::new(); distance_histograms_size];
    mb.command_histograms = vec![HistogramCommand::new(); mb.command_split.num_types];

    build_histograms_with_context(
        cmds,
        &mb.literal_split,
        &mb.command_split,
        &mb.distance_split,
        ringbuffer,
        pos,
        mask,
        prev_byte,
        prev_byte2,
        literal_context_modes.as_deref(),
        &mut literal_histograms,
        &mut mb.command_histograms,
        &mut distance_histograms,
    );

    // Cluster the literal histograms down to one byte of tree ids and
    // derive the context map.
    cluster_histograms(
        &literal_histograms,
        K_MAX_NUMBER_OF_HISTOGRAMS,
        &mut mb.literal_histograms,
        &mut mb.literal_context_map,
    );
    if !use_literal_context {
        // The per-type ids substitute for a full context map.
        let per_type: Vec<u32> = mb.literal_context_map.clone();
        mb.literal_context_map = vec![0; mb.literal_split.num_types << LITERAL_CONTEXT_BITS];
        for (ty, &id) in per_type.iter().enumerate() {
            for j in 0..(1 << LITERAL_CONTEXT_BITS) {
                mb.literal_context_map[(ty << LITERAL_CONTEXT_BITS) + j] = id;
            }
        }
    }

    cluster_histograms(
        &distance_histograms,
        K_MAX_NUMBER_OF_HISTOGRAMS,
        &mut mb.distance_histograms,
        &mut mb.distance_context_map,
    );
}

/// RLE-friendliness pass over every histogram of the meta-block.
pub fn optimize_histograms(num_effective_distance_codes: usize, mb: &mut MetaBlockSplit) {
    let mut good_for_rle = [0u8; crate::constants::NUM_COMMAND_SYMBOLS];
    for histogram in mb.literal_histograms.iter_mut() {
        optimize_huffman_counts_for_rle(256, &mut histogram.data, &mut good_for_rle);
    }
    for histogram in mb.command_histograms.iter_mut() {
        optimize_huffman_counts_for_rle(
            crate::constants::NUM_COMMAND_SYMBOLS,
            &mut histogram.data,
            &mut good_for_rle,
        );
    }
    for histogram in mb.distance_histograms.iter_mut() {
        optimize_huffman_counts_for_rle(
            num_effective_distance_codes,
            &mut histogram.data,
            &mut good_for_rle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EncoderParams;

    fn build_commands(data_len: usize) -> Vec<Command> {
        // One big insert command covering the whole input.
        vec![Command::new_insert(data_len)]
    }

    fn hq_params() -> EncoderParams {
        let mut p = EncoderParams {
            quality: 10,
            lgwin: 16,
            ..Default::default()
        };
        p.sanitize();
        p.choose_distance_params();
        p
    }

    #[test]
    fn test_context_map_shape() {
        let params = hq_params();
        let mut data = Vec::new();
        for i in 0..3000usize {
            data.push(if i % 7 == 0 { b' ' } else { b'a' + (i % 13) as u8 });
        }
        let cmds = build_commands(data.len());
        let mut mb = MetaBlockSplit::default();
        build_meta_block(
            &data,
            0,
            usize::MAX >> 1,
            &params,
            0,
            0,
            &cmds,
            ContextMode::Utf8,
            &mut mb,
        );
        assert_eq!(
            mb.literal_context_map.len(),
            mb.literal_split.num_types << LITERAL_CONTEXT_BITS
        );
        let num_literal_trees = mb.literal_histograms.len();
        assert!(num_literal_trees >= 1);
        for &id in &mb.literal_context_map {
            assert!((id as usize) < num_literal_trees);
        }
        assert_eq!(mb.command_histograms.len(), mb.command_split.num_types);
        assert_eq!(
            mb.distance_context_map.len(),
            mb.distance_split.num_types << DISTANCE_CONTEXT_BITS
        );
    }

    #[test]
    fn test_disabled_context_modeling_replicates_ids() {
        let mut params = hq_params();
        params.disable_literal_context_modeling = true;
        let data = vec![b'x'; 1000];
        let cmds = build_commands(data.len());
        let mut mb = MetaBlockSplit::default();
        build_meta_block(
            &data,
            0,
            usize::MAX >> 1,
            &params,
            0,
            0,
            &cmds,
            ContextMode::Utf8,
            &mut mb,
        );
        // Every context of one block type maps to the same tree.
        for ty in 0..mb.literal_split.num_types {
            let base = mb.literal_context_map[ty << LITERAL_CONTEXT_BITS];
            for j in 0..(1 << LITERAL_CONTEXT_BITS) {
                assert_eq!(mb.literal_context_map[(ty << LITERAL_CONTEXT_BITS) + j], base);
            }
        }
    }
}
