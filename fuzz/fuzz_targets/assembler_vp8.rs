#![no_main]

use vpu_codecs::assembler::vp8::Vp8Assembler;
use vpu_codecs::backend::dummy::DummyHardware;
use vpu_codecs::bitstream_utils::IvfIterator;
use vpu_codecs::decoder::VpuDecoder;
use vpu_codecs::pack::VideoBuffer;
use vpu_codecs::utils::decode_stream;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut assembler = Vp8Assembler::new();
    let mut decoder = VpuDecoder::new(DummyHardware::default(), Default::default());

    let buffers = IvfIterator::new(data)
        .enumerate()
        .map(|(i, frame)| VideoBuffer::new(frame.to_vec(), i as i64));

    let _ = decode_stream(&mut assembler, &mut decoder, buffers, &mut |_| ());
});
