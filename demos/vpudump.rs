// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vpudump, a tool splitting a H.264, VP8 or JPEG stream into the packs the hardware would be fed.
//! Optionally runs them through the dummy backend to check the decoder's behavior on the stream.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

use argh::FromArgs;
use log::info;

use vpu_codecs::assembler::new_assembler;
use vpu_codecs::backend::dummy::DummyHardware;
use vpu_codecs::decoder::VpuDecoder;
use vpu_codecs::pack::PackQueue;
use vpu_codecs::utils::decode_stream;
use vpu_codecs::utils::input_buffers;
use vpu_codecs::utils::pack_checksum;
use vpu_codecs::CodecType;
use vpu_codecs::DecoderConfig;

/// Dumps the packs assembled from a stream
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// input format (h264, vp8 or jpeg)
    #[argh(option)]
    input_format: CodecType,

    /// never ask the hardware to reorder frames
    #[argh(switch)]
    disable_reordering: bool,

    /// decode the packs with the dummy backend
    #[argh(switch)]
    decode: bool,

    /// with --decode, display the MD5 of each decoded frame
    #[argh(switch)]
    compute_md5: bool,

    /// with --decode, file to write the visible NV12 frames to
    #[argh(option)]
    output: Option<PathBuf>,

    /// with --decode, skip droppable packs once more than this many are queued
    #[argh(option)]
    max_queued_packs: Option<usize>,
}

fn dump_packs(codec: CodecType, config: &DecoderConfig, input: &[u8]) -> anyhow::Result<()> {
    let mut assembler = new_assembler(codec, config)
        .ok_or_else(|| anyhow::anyhow!("no assembler for {}", codec))?;
    let mut queue = PackQueue::new();

    for buffer in input_buffers(codec, input)? {
        assembler.process_buffer(&mut queue, buffer);
    }
    assembler.end_of_input(&mut queue);

    for (i, pack) in queue.iter().enumerate() {
        let kinds: Vec<String> = pack
            .chunks()
            .iter()
            .map(|chunk| format!("{:?}", chunk))
            .collect();

        println!(
            "pack {:4}: ts {:>6} {} refs {} {}{}{}{} crc32 {:08x} [{}]",
            i,
            pack.timestamp().map_or("-".to_string(), |ts| ts.to_string()),
            pack.geometry,
            pack.reference_count,
            if pack.can_reopen_decoding { "R" } else { "-" },
            if pack.can_be_dropped { "D" } else { "-" },
            if pack.discontinuity { "!" } else { "-" },
            if pack.needs_flushing { "F" } else { "-" },
            pack_checksum(pack),
            kinds.join(" ")
        );
    }

    info!("{} packs", queue.len());
    Ok(())
}

fn decode(codec: CodecType, config: DecoderConfig, input: &[u8], args: &Args) -> anyhow::Result<()> {
    let mut assembler = new_assembler(codec, &config)
        .ok_or_else(|| anyhow::anyhow!("no assembler for {}", codec))?;
    let mut decoder = VpuDecoder::new(DummyHardware::default(), config);
    let mut output = args.output.as_ref().map(File::create).transpose()?;

    let mut frame_num = 0;
    let mut result = Ok(());
    let mut on_new_frame = |frame: &vpu_codecs::decoder::OutputFrame| {
        if result.is_err() {
            return;
        }

        let mut picture = vec![0; frame.visible_size()];
        result = frame.read_visible(&mut picture).map_err(anyhow::Error::from);

        if args.compute_md5 {
            println!("frame {:4}: {:x}", frame_num, md5::compute(&picture));
        }
        if let Some(output) = output.as_mut() {
            if let Err(e) = output.write_all(&picture) {
                result = Err(e.into());
            }
        }
        frame_num += 1;
    };

    let buffers = input_buffers(codec, input)?;
    let frames = decode_stream(assembler.as_mut(), &mut decoder, buffers, &mut on_new_frame)?;
    result?;

    let stats = decoder.stats();
    println!(
        "{} frames decoded in {} hardware steps, {} rolled back, {} packs skipped",
        frames,
        stats.number_of_decode_operations,
        stats.number_of_rolled_back_decodes,
        stats.number_of_dropped_packs
    );

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut input = Vec::new();
    File::open(&args.input)?.read_to_end(&mut input)?;

    let config = DecoderConfig {
        disable_reordering: args.disable_reordering,
        max_queued_packs: args.max_queued_packs,
        ..Default::default()
    };

    dump_packs(args.input_format, &config, &input)?;

    if args.decode {
        decode(args.input_format, config, &input, &args)?;
    }

    Ok(())
}
