pub mod drm;
#[cfg(feature = "gbm")]
pub mod gbm;

pub type Modifier = u64;

pub const INVALID_MODIFIER: Modifier = 0x00ff_ffff_ffff_ffff;
pub const LINEAR_MODIFIER: Modifier = 0;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const XRGB8888: u32 = fourcc(b'X', b'R', b'2', b'4');
pub const ARGB8888: u32 = fourcc(b'A', b'R', b'2', b'4');
pub const RGB565: u32 = fourcc(b'R', b'G', b'1', b'6');

/// Maps a legacy depth/bpp pair to the matching fourcc.
pub fn format_for_depth(bpp: u32, depth: u32) -> Option<u32> {
    let format = match (bpp, depth) {
        (32, 24) => XRGB8888,
        (32, 32) => ARGB8888,
        (16, 16) => RGB565,
        _ => return None,
    };
    Some(format)
}

/// The depth the legacy addfb path reports for a bpp.
pub fn depth_for_bpp(bpp: u32) -> u32 {
    match bpp {
        32 => 24,
        n => n,
    }
}
