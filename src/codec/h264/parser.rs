// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the H.264 syntax elements needed to split a stream into pictures: sequence and
//! picture parameter sets, and the first part of slice headers.
//!
//! All parsers take a whole NAL unit, Annex-B start code included.

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::FrameGeometry;
use crate::MACROBLOCK_SIZE;

pub const MAX_SPS_COUNT: usize = 32;
pub const MAX_PPS_COUNT: usize = 256;

/// The maximum number of reference frames, as per A.3.1, clause h)
const MAX_REF_FRAMES: u32 = 16;
/// Widest and tallest picture any level allows, in macroblocks (or map units): sqrt(8 * 139264).
const MAX_PIC_DIMENSION_IN_MBS: u32 = 1055;

/// Profiles whose SPS carries the chroma format, bit depths and scaling matrices.
pub(crate) const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Skips the start code of `nalu`, checks its header and returns it with a reader positioned on
/// the first RBSP bit.
fn open_nalu(nalu: &[u8]) -> anyhow::Result<(NaluHeader, BitReader)> {
    let start = nalu
        .iter()
        .position(|b| *b != 0)
        .ok_or(anyhow!("NAL unit only has zero bytes"))?;
    if nalu[start] != 0x01 {
        return Err(anyhow!("NAL unit does not start with a start code"));
    }

    let header_byte = *nalu.get(start + 1).ok_or(anyhow!("NAL unit without header"))?;
    let header = NaluHeader::from_byte(header_byte);
    if header.forbidden_zero_bit {
        return Err(anyhow!("forbidden_zero_bit set in NAL unit header"));
    }

    Ok((header, BitReader::new(&nalu[start + 2..], true)))
}

fn expect_type(header: &NaluHeader, expected: NaluType) -> anyhow::Result<()> {
    if header.type_value != expected as u8 {
        return Err(anyhow!(
            "Invalid NALU type, expected {:?}, got {}",
            expected,
            header
        ));
    }

    Ok(())
}

/// A H.264 Sequence Parameter Set. H.264 7.4.2.1.1
///
/// Only the fields up to the cropping window are parsed. VUI is not needed to assemble
/// pictures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    /// The six constraint_set flags and the two reserved bits, as in the bitstream.
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,

    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
}

impl Sps {
    pub fn padded_width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * MACROBLOCK_SIZE
    }

    pub fn padded_height(&self) -> u32 {
        let map_units = self.pic_height_in_map_units_minus1 + 1;
        map_units * MACROBLOCK_SIZE * (2 - u32::from(self.frame_mbs_only_flag))
    }

    /// Horizontal and vertical crop units, in luma samples.
    fn crop_units(&self) -> (u32, u32) {
        if self.frame_mbs_only_flag {
            (2, 2)
        } else {
            (2, 4)
        }
    }

    /// Geometry of the coded pictures. Crops that do not fit inside the padded picture are
    /// rejected at parse time, so the subtractions below cannot wrap.
    pub fn geometry(&self) -> FrameGeometry {
        let (unit_x, unit_y) = self.crop_units();
        let crop_x = (self.frame_crop_left_offset + self.frame_crop_right_offset) * unit_x;
        let crop_y = (self.frame_crop_top_offset + self.frame_crop_bottom_offset) * unit_y;

        FrameGeometry::new(
            self.padded_width(),
            self.padded_height(),
            self.padded_width().saturating_sub(crop_x),
            self.padded_height().saturating_sub(crop_y),
            self.frame_crop_left_offset * unit_x,
            self.frame_crop_top_offset * unit_y,
        )
    }

    /// Streams with more than one reference frame may reorder pictures for display.
    pub fn needs_reordering(&self) -> bool {
        self.max_num_ref_frames > 1
    }

    pub fn frame_num_bits(&self) -> usize {
        usize::from(self.log2_max_frame_num_minus4) + 4
    }

    pub fn pic_order_cnt_lsb_bits(&self) -> usize {
        usize::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4
    }

    fn validate_crop(&self) -> anyhow::Result<()> {
        let (unit_x, unit_y) = self.crop_units();

        self.frame_crop_left_offset
            .checked_add(self.frame_crop_right_offset)
            .and_then(|c| c.checked_mul(unit_x))
            .and_then(|c| self.padded_width().checked_sub(c))
            .ok_or(anyhow!("Invalid frame crop width"))?;

        self.frame_crop_top_offset
            .checked_add(self.frame_crop_bottom_offset)
            .and_then(|c| c.checked_mul(unit_y))
            .and_then(|c| self.padded_height().checked_sub(c))
            .ok_or(anyhow!("Invalid frame crop height"))?;

        Ok(())
    }
}

/// Skips a scaling list, H.264 7.3.2.1.1.1. Only the syntax matters here.
fn skip_scaling_list(r: &mut BitReader, size: usize) -> anyhow::Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;

    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = r.read_se()?;
            next_scale = (last_scale + delta_scale).rem_euclid(256);
        }

        if next_scale != 0 {
            last_scale = next_scale;
        }
    }

    Ok(())
}

/// Parses a complete SPS NAL unit.
pub fn parse_sps(nalu: &[u8]) -> anyhow::Result<Sps> {
    let (header, mut r) = open_nalu(nalu)?;
    expect_type(&header, NaluType::Sps)?;

    let mut sps = Sps {
        profile_idc: r.read_bits::<u32>(8)? as u8,
        constraint_flags: r.read_bits::<u32>(8)? as u8,
        level_idc: r.read_bits::<u32>(8)? as u8,
        seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT as u32 - 1)? as u8,
        chroma_format_idc: 1,
        ..Default::default()
    };

    if HIGH_PROFILES.contains(&sps.profile_idc) {
        sps.chroma_format_idc = r.read_ue_max(3)? as u8;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit()?;
        }

        sps.bit_depth_luma_minus8 = r.read_ue_max(6)? as u8;
        sps.bit_depth_chroma_minus8 = r.read_ue_max(6)? as u8;
        sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
        sps.seq_scaling_matrix_present_flag = r.read_bit()?;

        if sps.seq_scaling_matrix_present_flag {
            let num_lists = if sps.chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..num_lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    sps.log2_max_frame_num_minus4 = r.read_ue_max(12)? as u8;
    sps.pic_order_cnt_type = r.read_ue_max(2)? as u8;

    if sps.pic_order_cnt_type == 0 {
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)? as u8;
    } else if sps.pic_order_cnt_type == 1 {
        sps.delta_pic_order_always_zero_flag = r.read_bit()?;
        sps.offset_for_non_ref_pic = r.read_se()?;
        sps.offset_for_top_to_bottom_field = r.read_se()?;

        let num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(255)?;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            sps.offset_for_ref_frame.push(r.read_se()?);
        }
    }

    sps.max_num_ref_frames = r.read_ue_max(MAX_REF_FRAMES)?;
    sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
    sps.pic_width_in_mbs_minus1 = r
        .read_ue_max(MAX_PIC_DIMENSION_IN_MBS - 1)
        .context("Broken stream: picture too wide")?;
    sps.pic_height_in_map_units_minus1 = r
        .read_ue_max(MAX_PIC_DIMENSION_IN_MBS - 1)
        .context("Broken stream: picture too tall")?;
    sps.frame_mbs_only_flag = r.read_bit()?;

    if !sps.frame_mbs_only_flag {
        sps.mb_adaptive_frame_field_flag = r.read_bit()?;
    }

    sps.direct_8x8_inference_flag = r.read_bit()?;
    sps.frame_cropping_flag = r.read_bit()?;

    if sps.frame_cropping_flag {
        sps.frame_crop_left_offset = r.read_ue()?;
        sps.frame_crop_right_offset = r.read_ue()?;
        sps.frame_crop_top_offset = r.read_ue()?;
        sps.frame_crop_bottom_offset = r.read_ue()?;
        sps.validate_crop()?;
    }

    Ok(sps)
}

/// A H.264 Picture Parameter Set. H.264 7.4.2.2
///
/// Parsing stops before `transform_8x8_mode_flag`, which would need the SPS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    /// Also known as `pic_order_present_flag`.
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub slice_group_map_type: u32,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i32,
    pub pic_init_qs_minus26: i32,
    pub chroma_qp_index_offset: i32,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
}

/// Skips the slice group map of a PPS, H.264 7.3.2.2.
fn skip_slice_groups(r: &mut BitReader, pps: &mut Pps) -> anyhow::Result<()> {
    let num_groups = pps.num_slice_groups_minus1;
    pps.slice_group_map_type = r.read_ue_max(6)?;

    match pps.slice_group_map_type {
        0 => {
            for _ in 0..=num_groups {
                // run_length_minus1
                r.read_ue()?;
            }
        }
        2 => {
            for _ in 0..num_groups {
                // top_left and bottom_right
                r.read_ue()?;
                r.read_ue()?;
            }
        }
        3..=5 => {
            // slice_group_change_direction_flag and slice_group_change_rate_minus1
            r.read_bit()?;
            r.read_ue()?;
        }
        6 => {
            let pic_size_in_map_units_minus1 = r.read_ue()?;
            // Ceil(Log2(num_slice_groups_minus1 + 1))
            let bits = (u32::BITS - num_groups.leading_zeros()) as usize;
            for _ in 0..=pic_size_in_map_units_minus1 {
                r.skip_bits(bits)?;
            }
        }
        _ => (),
    }

    Ok(())
}

/// Parses a complete PPS NAL unit.
pub fn parse_pps(nalu: &[u8]) -> anyhow::Result<Pps> {
    let (header, mut r) = open_nalu(nalu)?;
    expect_type(&header, NaluType::Pps)?;

    let mut pps = Pps {
        pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT as u32 - 1)? as u8,
        seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT as u32 - 1)? as u8,
        entropy_coding_mode_flag: r.read_bit()?,
        bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
        num_slice_groups_minus1: r.read_ue_max(7)?,
        ..Default::default()
    };

    if pps.num_slice_groups_minus1 > 0 {
        skip_slice_groups(&mut r, &mut pps)?;
    }

    pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
    pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;
    pps.weighted_pred_flag = r.read_bit()?;
    pps.weighted_bipred_idc = r.read_bits::<u32>(2)? as u8;
    pps.pic_init_qp_minus26 = r.read_se_bounded(-26 - 48, 25)?;
    pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;
    pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
    pps.deblocking_filter_control_present_flag = r.read_bit()?;
    pps.constrained_intra_pred_flag = r.read_bit()?;
    pps.redundant_pic_cnt_present_flag = r.read_bit()?;

    Ok(pps)
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

/// The leading fields of a slice header, up to `redundant_pic_cnt`. H.264 7.4.3
///
/// Fields not present in the bitstream are zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
    pub idr_pic_flag: bool,
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,

    pub colour_plane_id: u8,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
}

impl SliceHeader {
    /// Whether `self` and `other` belong to different pictures. This is the detection of the
    /// first VCL unit of a primary coded picture from H.264 7.4.1.2.4, comparing the full
    /// `nal_ref_idc` and `idr_pic_id` values.
    pub fn is_different_picture(&self, other: &SliceHeader) -> bool {
        self.frame_num != other.frame_num
            || self.pic_parameter_set_id != other.pic_parameter_set_id
            || self.field_pic_flag != other.field_pic_flag
            || self.bottom_field_flag != other.bottom_field_flag
            || self.nal_ref_idc != other.nal_ref_idc
            || self.pic_order_cnt_lsb != other.pic_order_cnt_lsb
            || self.delta_pic_order_cnt_bottom != other.delta_pic_order_cnt_bottom
            || self.delta_pic_order_cnt != other.delta_pic_order_cnt
            || self.idr_pic_flag != other.idr_pic_flag
            || self.idr_pic_id != other.idr_pic_id
            || self.redundant_pic_cnt != other.redundant_pic_cnt
    }
}

fn parse_slice_header_start<'a>(nalu: &'a [u8]) -> anyhow::Result<(SliceHeader, BitReader<'a>)> {
    let (header, mut r) = open_nalu(nalu)?;
    if !header.type_().is_some_and(|t| t.starts_picture()) {
        return Err(anyhow!("NAL unit {} does not carry a slice header", header));
    }

    let mut hdr = SliceHeader {
        nal_ref_idc: header.ref_idc,
        nal_unit_type: header.type_value,
        idr_pic_flag: header.idr_pic_flag(),
        first_mb_in_slice: r.read_ue()?,
        ..Default::default()
    };

    let slice_type = r.read_ue_max(9)?;
    let slice_type = if slice_type >= 5 { slice_type - 5 } else { slice_type };
    hdr.slice_type = SliceType::n(slice_type).with_context(|| format!("Invalid slice type {}", slice_type))?;
    hdr.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)? as u8;

    Ok((hdr, r))
}

/// Parses the part of a slice header that does not depend on parameter sets, enough to find
/// which PPS the slice refers to.
pub fn parse_slice_header_initial(nalu: &[u8]) -> anyhow::Result<SliceHeader> {
    parse_slice_header_start(nalu).map(|(hdr, _)| hdr)
}

/// Parses a slice header up to `redundant_pic_cnt`, using the parameter sets it refers to.
pub fn parse_slice_header(nalu: &[u8], sps: &Sps, pps: &Pps) -> anyhow::Result<SliceHeader> {
    let (mut hdr, mut r) = parse_slice_header_start(nalu)?;

    if hdr.pic_parameter_set_id != pps.pic_parameter_set_id {
        return Err(anyhow!(
            "slice refers to PPS {}, got PPS {}",
            hdr.pic_parameter_set_id,
            pps.pic_parameter_set_id
        ));
    }

    if sps.separate_colour_plane_flag {
        hdr.colour_plane_id = r.read_bits::<u32>(2)? as u8;
    }

    hdr.frame_num = r.read_bits(sps.frame_num_bits())?;

    if !sps.frame_mbs_only_flag {
        hdr.field_pic_flag = r.read_bit()?;
        if hdr.field_pic_flag {
            hdr.bottom_field_flag = r.read_bit()?;
        }
    }

    if hdr.idr_pic_flag {
        hdr.idr_pic_id = r.read_ue_max(0xffff)?;
    }

    let pic_order_present = pps.bottom_field_pic_order_in_frame_present_flag;

    if sps.pic_order_cnt_type == 0 {
        hdr.pic_order_cnt_lsb = r.read_bits(sps.pic_order_cnt_lsb_bits())?;
        if pic_order_present && !hdr.field_pic_flag {
            hdr.delta_pic_order_cnt_bottom = r.read_se()?;
        }
    }

    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        hdr.delta_pic_order_cnt[0] = r.read_se()?;
        if pic_order_present && !hdr.field_pic_flag {
            hdr.delta_pic_order_cnt[1] = r.read_se()?;
        }
    }

    if pps.redundant_pic_cnt_present_flag {
        hdr.redundant_pic_cnt = r.read_ue_max(127)?;
    }

    Ok(hdr)
}
