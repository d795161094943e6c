use {
    kms_core::{
        device::Device,
        props::{PLANE_TYPE_CURSOR, PLANE_TYPE_PRIMARY},
    },
    std::error::Error,
};

pub fn main(device: &Device) -> Result<(), Box<dyn Error>> {
    let res = device.resources();
    println!(
        "{} mode-setting, framebuffers from {}x{} to {}x{}",
        if device.is_atomic() { "atomic" } else { "legacy" },
        res.min_size.0,
        res.min_size.1,
        res.max_size.0,
        res.max_size.1,
    );
    println!("crtcs:");
    for crtc in &res.crtcs {
        print!("  {} (pipe {}): {:?}", crtc.id, crtc.idx, crtc.state.get());
        if let Some(req) = crtc.desired_mode() {
            print!(", {}", req.mode);
        }
        println!();
    }
    println!("outputs:");
    let outputs = res.outputs();
    for output in &outputs {
        print!("  {}: {}", output.name, output.status.get());
        if let Some(crtc) = output.crtc.get() {
            print!(", crtc {}", crtc);
        }
        if output.non_desktop.get() {
            print!(", non-desktop");
        }
        println!();
        let clones: Vec<_> = outputs
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx < 32 && output.possible_clones.get() & (1 << idx) != 0)
            .map(|(_, o)| o.name.as_str())
            .collect();
        if !clones.is_empty() {
            println!("    clones: {}", clones.join(", "));
        }
        for mode in output.modes.borrow().iter() {
            let preferred = if mode.is_preferred() { " (preferred)" } else { "" };
            println!("    {}{}", mode, preferred);
        }
    }
    println!("planes:");
    for plane in &res.planes {
        let ty = match plane.ty() {
            PLANE_TYPE_PRIMARY => "primary",
            PLANE_TYPE_CURSOR => "cursor",
            _ => "overlay",
        };
        println!(
            "  {} ({}): crtcs {:#x}, {} formats",
            plane.id,
            ty,
            plane.possible_crtcs,
            plane.formats.len()
        );
    }
    Ok(())
}
