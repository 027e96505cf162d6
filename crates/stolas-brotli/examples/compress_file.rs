//! Compresses stdin to stdout (or decompresses with `-d`).
//!
//! ```sh
//! echo "hello hello hello" | cargo run --example compress_file | wc -c
//! cat file.br | cargo run --example compress_file -- -d
//! ```

use std::io::{self, Read, Write};
use stolas_brotli::{Reader, Writer};
use stolas_core::CompressionLevel;

fn main() -> io::Result<()> {
    let decompress = std::env::args().any(|a| a == "-d");
    let stdin = io::stdin();
    let stdout = io::stdout();

    if decompress {
        let mut reader = Reader::new(stdin.lock());
        let mut out = stdout.lock();
        let mut buf = [0u8; 65536];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
    } else {
        let mut writer = Writer::new(stdout.lock(), CompressionLevel::Best);
        let mut input = stdin.lock();
        let mut buf = [0u8; 65536];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        writer.finish()?;
    }
    Ok(())
}
