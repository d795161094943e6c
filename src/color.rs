//! Gamma ramps, color transform matrices and variable refresh.
//!
//! Blob-backed properties keep exactly one kernel blob per crtc. A new blob
//! replaces the old one only after the kernel accepted it, so a rejected
//! update leaves the previous state and its blob untouched.

use {
    crate::{
        kernel::{ErrorKind, KmsKernel},
        props::{CrtcProp, PropertySchema},
        resources::{Crtc, Output},
        utils::oserror::OsError,
        video::drm::{Change, DrmBlob, DrmError, DrmObject, log_drop_error},
    },
    std::{cell::Cell, rc::Rc},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ColorError {
    #[error("Gamma ramps must be non-empty and of equal length")]
    InvalidRamp,
    #[error("Crtc has no gamma ramp")]
    NoGamma,
    #[error("Crtc has no color transform matrix")]
    NoCtm,
    #[error("Could not create the {0} blob")]
    CreateBlob(&'static str, #[source] DrmError),
    #[error("Could not commit {0}")]
    Commit(&'static str, #[source] OsError),
    #[error("The legacy gamma ioctl failed")]
    Legacy(#[source] OsError),
}

impl ColorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ColorError::InvalidRamp => ErrorKind::KernelRejected,
            ColorError::NoGamma | ColorError::NoCtm => ErrorKind::Unsupported,
            ColorError::CreateBlob(_, e) => ErrorKind::from_drm(e),
            ColorError::Commit(_, e) | ColorError::Legacy(e) => ErrorKind::from_os(*e),
        }
    }
}

/// How color properties reach the kernel.
#[derive(Copy, Clone, Debug)]
pub struct ColorPath {
    pub atomic: bool,
    /// Use `GAMMA_LUT` when the crtc has it.
    pub gamma_lut: bool,
}

/// Linearly resamples a ramp to `len` entries.
pub fn resample(ramp: &[u16], len: usize) -> Vec<u16> {
    if ramp.len() == len || ramp.is_empty() {
        return ramp.to_vec();
    }
    if len == 1 {
        return vec![ramp[0]];
    }
    let last = (ramp.len() - 1) as f64;
    (0..len)
        .map(|i| {
            let pos = i as f64 * last / (len - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(ramp.len() - 1);
            let t = pos - lo as f64;
            let v = ramp[lo] as f64 * (1.0 - t) + ramp[hi] as f64 * t;
            v.round() as u16
        })
        .collect()
}

/// Serializes a `drm_color_lut` array.
pub fn lut_bytes(red: &[u16], green: &[u16], blue: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(red.len() * 8);
    for ((r, g), b) in red.iter().zip(green).zip(blue) {
        for v in [*r, *g, *b, 0] {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
    }
    bytes
}

/// Converts to S31.32 sign-magnitude.
pub fn s31_32(v: f64) -> u64 {
    let mag = (v.abs() * (1u64 << 32) as f64) as u64 & !(1 << 63);
    match v.is_sign_negative() && mag != 0 {
        true => mag | (1 << 63),
        false => mag,
    }
}

/// Serializes a row-major 3x3 matrix as a `drm_color_ctm`.
pub fn ctm_bytes(matrix: &[f64; 9]) -> Vec<u8> {
    matrix
        .iter()
        .flat_map(|v| s31_32(*v).to_ne_bytes())
        .collect()
}

pub fn set_gamma(
    kernel: &dyn KmsKernel,
    crtc: &Crtc,
    path: ColorPath,
    red: &[u16],
    green: &[u16],
    blue: &[u16],
) -> Result<(), ColorError> {
    if red.is_empty() || red.len() != green.len() || red.len() != blue.len() {
        return Err(ColorError::InvalidRamp);
    }
    let lut_size = crtc.props.raw_value(CrtcProp::GammaLutSize).unwrap_or(0) as usize;
    if path.gamma_lut && crtc.props.is_present(CrtcProp::GammaLut) && lut_size > 0 {
        let bytes = lut_bytes(
            &resample(red, lut_size),
            &resample(green, lut_size),
            &resample(blue, lut_size),
        );
        return replace_blob(
            kernel,
            crtc,
            path,
            CrtcProp::GammaLut,
            &crtc.gamma_blob,
            Some(&bytes),
        );
    }
    let size = crtc.gamma_size as usize;
    if size == 0 {
        return Err(ColorError::NoGamma);
    }
    kernel
        .set_gamma(
            crtc.id,
            &resample(red, size),
            &resample(green, size),
            &resample(blue, size),
        )
        .map_err(ColorError::Legacy)?;
    log::debug!("Set a legacy gamma ramp on crtc {}", crtc.id);
    Ok(())
}

/// Sets or, with `None`, clears the color transform matrix.
pub fn set_ctm(
    kernel: &dyn KmsKernel,
    crtc: &Crtc,
    path: ColorPath,
    matrix: Option<&[f64; 9]>,
) -> Result<(), ColorError> {
    if !crtc.props.is_present(CrtcProp::Ctm) {
        return Err(ColorError::NoCtm);
    }
    let bytes = matrix.map(ctm_bytes);
    replace_blob(
        kernel,
        crtc,
        path,
        CrtcProp::Ctm,
        &crtc.ctm_blob,
        bytes.as_deref(),
    )
}

fn replace_blob(
    kernel: &dyn KmsKernel,
    crtc: &Crtc,
    path: ColorPath,
    prop: CrtcProp,
    slot: &Cell<DrmBlob>,
    data: Option<&[u8]>,
) -> Result<(), ColorError> {
    let blob = match data {
        Some(data) => kernel
            .create_blob(data)
            .map_err(|e| ColorError::CreateBlob(prop.name(), e))?,
        None => DrmBlob::NONE,
    };
    if let Err(e) = write_prop(kernel, crtc, path, prop, blob.0 as u64) {
        if blob.is_some() {
            log_drop_error("blob", kernel.destroy_blob(blob));
        }
        return Err(ColorError::Commit(prop.name(), e));
    }
    let old = slot.replace(blob);
    if old.is_some() {
        log_drop_error("blob", kernel.destroy_blob(old));
    }
    log::debug!("Updated {} on crtc {}", prop.name(), crtc.id);
    Ok(())
}

fn write_prop(
    kernel: &dyn KmsKernel,
    crtc: &Crtc,
    path: ColorPath,
    prop: CrtcProp,
    value: u64,
) -> Result<(), OsError> {
    if !path.atomic {
        return crtc.props.set_now(kernel, prop, value);
    }
    let mut change = Change::default();
    change.change_object(crtc.id, |oc| crtc.props.write(oc, prop, value));
    match kernel.atomic(0, &change, 0) {
        Ok(()) => {
            crtc.props.apply_pending();
            Ok(())
        }
        Err(e) => {
            crtc.props.discard_pending();
            Err(e)
        }
    }
}

/// Enables or disables variable refresh.
///
/// Returns whether the request applies to this crtc. It is a no-op unless
/// `allowed` is set and every output bound to the crtc is capable.
pub fn set_vrr(
    kernel: &dyn KmsKernel,
    crtc: &Crtc,
    outputs: &[Rc<Output>],
    path: ColorPath,
    allowed: bool,
    enabled: bool,
) -> Result<bool, ColorError> {
    let capable = !outputs.is_empty() && outputs.iter().all(|o| o.vrr_capable());
    if !allowed || !capable || !crtc.props.is_present(CrtcProp::VrrEnabled) {
        return Ok(false);
    }
    if crtc.vrr.get() == enabled {
        return Ok(true);
    }
    write_prop(kernel, crtc, path, CrtcProp::VrrEnabled, enabled as u64)
        .map_err(|e| ColorError::Commit(CrtcProp::VrrEnabled.name(), e))?;
    crtc.vrr.set(enabled);
    log::debug!(
        "Variable refresh {} on crtc {}",
        if enabled { "enabled" } else { "disabled" },
        crtc.id
    );
    Ok(true)
}
