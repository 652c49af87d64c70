//! ITU-T G.711 A-law and u-law companding.
//!
//! Segment-table implementation of the reference encoder/decoder. A-law works on
//! a 13-bit magnitude with even bits inverted (XOR 0x55); u-law works on a 14-bit
//! magnitude with a bias of 0x84 and is stored one's-complemented.

const SIGN_BIT: u8 = 0x80;
const QUANT_MASK: u8 = 0x0F;
const SEG_SHIFT: u8 = 4;
const SEG_MASK: u8 = 0x70;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];

fn segment(value: i32, table: &[i32; 8]) -> usize {
    table
        .iter()
        .position(|&end| value <= end)
        .unwrap_or(table.len())
}

pub fn linear_to_alaw(pcm: i16) -> u8 {
    let mut value = (pcm as i32) >> 3;
    let mask: i32 = if value >= 0 {
        0xD5
    } else {
        value = -value - 1;
        0x55
    };

    let seg = segment(value, &SEG_AEND);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }

    let mut aval = (seg as i32) << SEG_SHIFT;
    if seg < 2 {
        aval |= (value >> 1) & QUANT_MASK as i32;
    } else {
        aval |= (value >> seg) & QUANT_MASK as i32;
    }
    (aval ^ mask) as u8
}

pub fn alaw_to_linear(alaw: u8) -> i16 {
    let a = alaw ^ 0x55;
    let mut t = ((a & QUANT_MASK) as i32) << 4;
    let seg = (a & SEG_MASK) >> SEG_SHIFT;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    (if a & SIGN_BIT != 0 { t } else { -t }) as i16
}

pub fn linear_to_ulaw(pcm: i16) -> u8 {
    let mut value = (pcm as i32) >> 2;
    let mask: i32 = if value < 0 {
        value = -value;
        0x7F
    } else {
        0xFF
    };
    value = value.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(value, &SEG_UEND);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }

    let uval = ((seg as i32) << SEG_SHIFT) | ((value >> (seg + 1)) & QUANT_MASK as i32);
    (uval ^ mask) as u8
}

pub fn ulaw_to_linear(ulaw: u8) -> i16 {
    let u = !ulaw;
    let mut t = (((u & QUANT_MASK) as i32) << 3) + ULAW_BIAS;
    t <<= (u & SEG_MASK) >> SEG_SHIFT;
    (if u & SIGN_BIT != 0 { ULAW_BIAS - t } else { t - ULAW_BIAS }) as i16
}

/// Decodes a buffer of A-law bytes into 16-bit linear samples.
pub fn decode_alaw(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| alaw_to_linear(b)).collect()
}

pub fn decode_ulaw(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| ulaw_to_linear(b)).collect()
}
