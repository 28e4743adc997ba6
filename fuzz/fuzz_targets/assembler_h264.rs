#![no_main]

use vpu_codecs::assembler::h264::H264Assembler;
use vpu_codecs::backend::dummy::DummyHardware;
use vpu_codecs::decoder::VpuDecoder;
use vpu_codecs::pack::VideoBuffer;
use vpu_codecs::utils::decode_stream;
use vpu_codecs::utils::H264UnitIterator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut assembler = H264Assembler::new(false);
    let mut decoder = VpuDecoder::new(DummyHardware::default(), Default::default());

    let buffers = H264UnitIterator::new(data)
        .enumerate()
        .map(|(i, unit)| VideoBuffer::new(unit.to_vec(), i as i64));

    let _ = decode_stream(&mut assembler, &mut decoder, buffers, &mut |_| ());
});
