//! GStreamer initialization
//!
//! Capture, encoding and the SRT sink all run on GStreamer elements. The
//! library is initialized once per process before any of them is built.

use std::sync::Once;

static GSTREAMER_INIT: Once = Once::new();

/// Initialize GStreamer. Safe to call from any thread, any number of times.
pub fn init_gstreamer() -> Result<(), gstreamer::glib::Error> {
    let mut first_call = false;
    GSTREAMER_INIT.call_once(|| first_call = true);

    gstreamer::init()?;
    if first_call {
        log::info!("[GStreamer] Initialized");
        log_gstreamer_version();
    }
    Ok(())
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("[GStreamer] Version {}.{}.{}{}", major, minor, micro, nano_str);
}

/// True when an element factory with this name is installed
pub fn has_element(name: &str) -> bool {
    gstreamer::ElementFactory::find(name).is_some()
}

/// Initialize GStreamer and report whether every named element is installed
pub fn elements_available(names: &[&str]) -> bool {
    init_gstreamer().is_ok() && names.iter().all(|name| has_element(name))
}
