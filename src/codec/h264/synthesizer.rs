// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes H.264 parameter sets and slice headers back into Annex-B NAL units.
//!
//! Used to build synthetic streams for the demo and the tests. Slice data is opaque filler.

use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::HIGH_PROFILES;
use crate::MACROBLOCK_SIZE;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.writer.rbsp_trailing_bits()?;
        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(ref_idc: u8, sps: &'n Sps, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps as u8)?;
        s.seq_parameter_set_data()?;
        s.rbsp_trailing_bits()
    }

    /// Writes a flat scaling matrix as the first 4x4 list, leaving the others to the fall-back
    /// rule.
    fn scaling_matrix(&mut self) -> SynthesizerResult<()> {
        let num_lists = if self.nalu.chroma_format_idc == 3 { 12 } else { 8 };

        for i in 0..num_lists {
            self.u(1, i == 0)?;
            if i == 0 {
                // 8 + 8 = 16, then 15 repetitions.
                self.se(8)?;
                for _ in 1..16 {
                    self.se(0)?;
                }
            }
        }

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        let sps = self.nalu;

        self.u(8, sps.profile_idc)?;
        self.u(8, sps.constraint_flags)?;
        self.u(8, sps.level_idc)?;
        self.ue(sps.seq_parameter_set_id)?;

        if HIGH_PROFILES.contains(&sps.profile_idc) {
            self.ue(sps.chroma_format_idc)?;
            if sps.chroma_format_idc == 3 {
                self.u(1, sps.separate_colour_plane_flag)?;
            }

            self.ue(sps.bit_depth_luma_minus8)?;
            self.ue(sps.bit_depth_chroma_minus8)?;
            self.u(1, sps.qpprime_y_zero_transform_bypass_flag)?;
            self.u(1, sps.seq_scaling_matrix_present_flag)?;

            if sps.seq_scaling_matrix_present_flag {
                self.scaling_matrix()?;
            }
        } else if sps.chroma_format_idc != 1 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(sps.log2_max_frame_num_minus4)?;
        self.ue(sps.pic_order_cnt_type)?;

        if sps.pic_order_cnt_type == 0 {
            self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;
        } else if sps.pic_order_cnt_type == 1 {
            self.u(1, sps.delta_pic_order_always_zero_flag)?;
            self.se(sps.offset_for_non_ref_pic)?;
            self.se(sps.offset_for_top_to_bottom_field)?;
            self.ue(sps.offset_for_ref_frame.len() as u32)?;
            for offset in &sps.offset_for_ref_frame {
                self.se(*offset)?;
            }
        }

        self.ue(sps.max_num_ref_frames)?;
        self.u(1, sps.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(sps.pic_width_in_mbs_minus1)?;
        self.ue(sps.pic_height_in_map_units_minus1)?;
        self.u(1, sps.frame_mbs_only_flag)?;
        if !sps.frame_mbs_only_flag {
            self.u(1, sps.mb_adaptive_frame_field_flag)?;
        }
        self.u(1, sps.direct_8x8_inference_flag)?;

        self.u(1, sps.frame_cropping_flag)?;
        if sps.frame_cropping_flag {
            self.ue(sps.frame_crop_left_offset)?;
            self.ue(sps.frame_crop_right_offset)?;
            self.ue(sps.frame_crop_top_offset)?;
            self.ue(sps.frame_crop_bottom_offset)?;
        }

        // vui_parameters_present_flag
        self.u(1, false)
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(ref_idc: u8, pps: &'n Pps, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps as u8)?;
        s.pic_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        let pps = self.nalu;

        // Slice group maps are not synthesized.
        if pps.num_slice_groups_minus1 != 0 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.u(1, pps.entropy_coding_mode_flag)?;
        self.u(1, pps.bottom_field_pic_order_in_frame_present_flag)?;
        self.ue(pps.num_slice_groups_minus1)?;
        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, pps.weighted_pred_flag)?;
        self.u(2, pps.weighted_bipred_idc)?;
        self.se(pps.pic_init_qp_minus26)?;
        self.se(pps.pic_init_qs_minus26)?;
        self.se(pps.chroma_qp_index_offset)?;
        self.u(1, pps.deblocking_filter_control_present_flag)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.redundant_pic_cnt_present_flag)
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice NAL unit: the header fields known to [`SliceHeader`], then `data` as the
    /// rest of the slice.
    pub fn synthesize(
        hdr: &'n SliceHeader,
        sps: &Sps,
        pps: &Pps,
        data: &[u8],
        writer: W,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: hdr,
        };

        s.writer.write_header(hdr.nal_ref_idc, hdr.nal_unit_type)?;
        s.slice_header(sps, pps)?;
        for byte in data {
            s.u(8, *byte)?;
        }
        s.rbsp_trailing_bits()
    }

    fn slice_header(&mut self, sps: &Sps, pps: &Pps) -> SynthesizerResult<()> {
        let hdr = self.nalu;

        self.ue(hdr.first_mb_in_slice)?;
        // All slices of the picture share the same type.
        self.ue(hdr.slice_type as u32 + 5)?;
        self.ue(hdr.pic_parameter_set_id)?;

        if sps.separate_colour_plane_flag {
            self.u(2, hdr.colour_plane_id)?;
        }

        self.u(sps.frame_num_bits(), hdr.frame_num)?;

        if !sps.frame_mbs_only_flag {
            self.u(1, hdr.field_pic_flag)?;
            if hdr.field_pic_flag {
                self.u(1, hdr.bottom_field_flag)?;
            }
        }

        if hdr.idr_pic_flag {
            self.ue(hdr.idr_pic_id)?;
        }

        let pic_order_present = pps.bottom_field_pic_order_in_frame_present_flag;

        if sps.pic_order_cnt_type == 0 {
            self.u(sps.pic_order_cnt_lsb_bits(), hdr.pic_order_cnt_lsb)?;
            if pic_order_present && !hdr.field_pic_flag {
                self.se(hdr.delta_pic_order_cnt_bottom)?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            self.se(hdr.delta_pic_order_cnt[0])?;
            if pic_order_present && !hdr.field_pic_flag {
                self.se(hdr.delta_pic_order_cnt[1])?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            self.ue(hdr.redundant_pic_cnt)?;
        }

        Ok(())
    }
}

/// Returns `sps` as an Annex-B NAL unit.
pub fn sps_nalu(sps: &Sps) -> SynthesizerResult<Vec<u8>> {
    let mut buf = Vec::new();
    Synthesizer::<'_, Sps, _>::synthesize(3, sps, &mut buf)?;
    Ok(buf)
}

/// Returns `pps` as an Annex-B NAL unit.
pub fn pps_nalu(pps: &Pps) -> SynthesizerResult<Vec<u8>> {
    let mut buf = Vec::new();
    Synthesizer::<'_, Pps, _>::synthesize(3, pps, &mut buf)?;
    Ok(buf)
}

/// Returns a slice NAL unit with header `hdr` followed by `data`.
pub fn slice_nalu(hdr: &SliceHeader, sps: &Sps, pps: &Pps, data: &[u8]) -> SynthesizerResult<Vec<u8>> {
    let mut buf = Vec::new();
    Synthesizer::<'_, SliceHeader, _>::synthesize(hdr, sps, pps, data, &mut buf)?;
    Ok(buf)
}

/// An end of stream NAL unit.
pub const END_OF_STREAM_NALU: [u8; 5] = [0x00, 0x00, 0x00, 0x01, NaluType::StreamEnd as u8];

/// An access unit delimiter allowing any slice type.
pub const AU_DELIMITER_NALU: [u8; 6] = [0x00, 0x00, 0x00, 0x01, NaluType::AuDelimiter as u8, 0xf0];

/// Builds [`Sps`] values from a picture size and a few stream properties.
pub struct SpsBuilder {
    sps: Sps,
    resolution: (u32, u32),
}

impl SpsBuilder {
    pub fn new(seq_parameter_set_id: u8) -> Self {
        Self {
            sps: Sps {
                profile_idc: 66,
                level_idc: 40,
                seq_parameter_set_id,
                chroma_format_idc: 1,
                log2_max_pic_order_cnt_lsb_minus4: 2,
                max_num_ref_frames: 1,
                frame_mbs_only_flag: true,
                direct_8x8_inference_flag: true,
                ..Default::default()
            },
            resolution: (MACROBLOCK_SIZE, MACROBLOCK_SIZE),
        }
    }

    pub fn profile_idc(mut self, value: u8) -> Self {
        self.sps.profile_idc = value;
        self
    }

    /// Visible size of the pictures. Padding and cropping are derived from it.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    pub fn max_num_ref_frames(mut self, value: u32) -> Self {
        self.sps.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only(mut self, value: bool) -> Self {
        self.sps.frame_mbs_only_flag = value;
        self
    }

    pub fn scaling_matrix_present(mut self, value: bool) -> Self {
        self.sps.seq_scaling_matrix_present_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.sps.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.sps.pic_order_cnt_type = value;
        self
    }

    pub fn build(mut self) -> Sps {
        let (width, height) = self.resolution;
        let map_unit_height = if self.sps.frame_mbs_only_flag {
            MACROBLOCK_SIZE
        } else {
            MACROBLOCK_SIZE * 2
        };

        let width_mbs = width.div_ceil(MACROBLOCK_SIZE);
        let height_map_units = height.div_ceil(map_unit_height);
        self.sps.pic_width_in_mbs_minus1 = width_mbs.saturating_sub(1);
        self.sps.pic_height_in_map_units_minus1 = height_map_units.saturating_sub(1);

        let (unit_x, unit_y) = if self.sps.frame_mbs_only_flag { (2, 2) } else { (2, 4) };
        let crop_right = (width_mbs * MACROBLOCK_SIZE - width) / unit_x;
        let crop_bottom = (height_map_units * map_unit_height - height) / unit_y;
        if crop_right != 0 || crop_bottom != 0 {
            self.sps.frame_cropping_flag = true;
            self.sps.frame_crop_right_offset = crop_right;
            self.sps.frame_crop_bottom_offset = crop_bottom;
        }

        self.sps
    }
}

/// Builds [`Pps`] values.
pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(pic_parameter_set_id: u8, seq_parameter_set_id: u8) -> Self {
        Self(Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            deblocking_filter_control_present_flag: true,
            ..Default::default()
        })
    }

    pub fn pic_order_present(mut self, value: bool) -> Self {
        self.0.bottom_field_pic_order_in_frame_present_flag = value;
        self
    }

    pub fn redundant_pic_cnt_present(mut self, value: bool) -> Self {
        self.0.redundant_pic_cnt_present_flag = value;
        self
    }

    pub fn build(self) -> Pps {
        self.0
    }
}

/// Builds [`SliceHeader`] values. Starts from a referenced P slice of frame 0.
pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        Self(SliceHeader {
            nal_ref_idc: 2,
            nal_unit_type: NaluType::Slice as u8,
            slice_type: SliceType::P,
            pic_parameter_set_id: pps.pic_parameter_set_id,
            ..Default::default()
        })
    }

    /// Turns the slice into an IDR I slice.
    pub fn idr(mut self, idr_pic_id: u32) -> Self {
        self.0.nal_ref_idc = 3;
        self.0.nal_unit_type = NaluType::SliceIdr as u8;
        self.0.idr_pic_flag = true;
        self.0.idr_pic_id = idr_pic_id;
        self.0.slice_type = SliceType::I;
        self.0.frame_num = 0;
        self
    }

    pub fn nal_unit_type(mut self, value: NaluType) -> Self {
        self.0.nal_unit_type = value as u8;
        self
    }

    pub fn nal_ref_idc(mut self, value: u8) -> Self {
        self.0.nal_ref_idc = value;
        self
    }

    pub fn slice_type(mut self, value: SliceType) -> Self {
        self.0.slice_type = value;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u32) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn bottom_field(mut self, value: bool) -> Self {
        self.0.field_pic_flag = true;
        self.0.bottom_field_flag = value;
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u32) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn delta_pic_order_cnt_bottom(mut self, value: i32) -> Self {
        self.0.delta_pic_order_cnt_bottom = value;
        self
    }

    pub fn redundant_pic_cnt(mut self, value: u32) -> Self {
        self.0.redundant_pic_cnt = value;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}
