//! Frame decoding diagnostic.
//!
//! Feeds hex-encoded frames through the protocol dispatcher and prints
//! the resulting envelopes. Useful for poking at captured traffic when a
//! source changes its encoding.
//!
//! Usage:
//!   cargo run --bin decode_probe -- [--mode auto|format_a|format_b] <hex frame>...
//!   cat frames.txt | cargo run --bin decode_probe

use crashflow::protocol::{self, DecoderMode};
use std::io::BufRead;

fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut mode = DecoderMode::Auto;
    if let Some(flag_index) = args.iter().position(|a| a == "--mode") {
        if let Some(value) = args.get(flag_index + 1) {
            mode = DecoderMode::parse(value);
        }
        args.drain(flag_index..(flag_index + 2).min(args.len()));
    }

    let frames: Vec<String> = if args.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .collect()
    } else {
        args
    };

    if frames.is_empty() {
        eprintln!("no frames given; pass hex strings as arguments or on stdin");
        std::process::exit(2);
    }

    let mut failures = 0;
    for (index, frame) in frames.iter().enumerate() {
        let bytes = match hex::decode(frame.trim()) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("frame {}: not valid hex: {}", index, err);
                failures += 1;
                continue;
            }
        };
        match protocol::decode(&bytes, mode) {
            Ok(envelope) => {
                let params = serde_json::to_string_pretty(&envelope.params)
                    .unwrap_or_else(|_| "<unprintable>".to_string());
                println!("frame {} ({} bytes, mode {})", index, bytes.len(), mode);
                println!("  command: {}", envelope.command);
                println!("  params: {}", params);
            }
            Err(err) => {
                eprintln!("frame {}: {}", index, err);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
}
