//! Identity-stable fingerprint stealth script.
//!
//! Each account must present the same browser fingerprint across restarts,
//! so the profile is derived deterministically from the account email (or
//! the identity index when no email is stored). The generated script runs
//! before any page script: it removes the `webdriver` marker, fills an
//! empty plugin list, pins the WebGL vendor/renderer pair, and perturbs
//! canvas reads with a stable sub-visual noise term.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::{rngs::StdRng, Rng, SeedableRng};

/// WebGL parameter ids for the unmasked vendor/renderer queries.
const GL_UNMASKED_VENDOR: u32 = 37445;
const GL_UNMASKED_RENDERER: u32 = 37446;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GpuProfile {
    pub vendor: &'static str,
    pub renderer: &'static str,
}

const GPU_PROFILES: [GpuProfile; 3] = [
    GpuProfile {
        vendor: "Google Inc. (Intel)",
        renderer: "ANGLE (Intel, Intel(R) UHD Graphics 630 (0x00003E9B) Direct3D11 vs_5_0 ps_5_0, D3D11)",
    },
    GpuProfile {
        vendor: "Google Inc. (NVIDIA)",
        renderer: "ANGLE (NVIDIA, NVIDIA GeForce GTX 1660 (0x00002184) Direct3D11 vs_5_0 ps_5_0, D3D11)",
    },
    GpuProfile {
        vendor: "Google Inc. (AMD)",
        renderer: "ANGLE (AMD, AMD Radeon RX 580 (0x000067DF) Direct3D11 vs_5_0 ps_5_0, D3D11)",
    },
];

/// Stable seed for an identity: hash of the lower-cased, trimmed email,
/// falling back to the index when no email is stored.
pub fn stable_seed(email: Option<&str>, index: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    match email.map(|e| e.trim().to_ascii_lowercase()).filter(|e| !e.is_empty()) {
        Some(normalized) => normalized.hash(&mut hasher),
        None => index.hash(&mut hasher),
    }
    hasher.finish()
}

pub fn profile_for_seed(seed: u64) -> GpuProfile {
    GPU_PROFILES[(seed % GPU_PROFILES.len() as u64) as usize]
}

/// Benign canvas noise in [0.0001, 0.001): large enough to decorrelate a
/// fingerprint hash, far too small to corrupt rendering.
pub fn noise_for_seed(seed: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed);
    rng.gen_range(0.0001..0.001)
}

/// Build the first-run stealth script for an identity seed.
pub fn build_stealth_script(seed: u64) -> String {
    let profile = profile_for_seed(seed);
    let noise = noise_for_seed(seed);
    let vendor = serde_json::to_string(profile.vendor).unwrap_or_default();
    let renderer = serde_json::to_string(profile.renderer).unwrap_or_default();

    format!(
        r#"(() => {{
  try {{
    Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined, configurable: true }});
  }} catch (e) {{}}

  try {{
    if (navigator.plugins && navigator.plugins.length === 0) {{
      Object.defineProperty(navigator, 'plugins', {{
        get: () => ({{ length: 3, item: () => null, namedItem: () => null, refresh: () => {{}} }}),
        configurable: true,
      }});
    }}
  }} catch (e) {{}}

  try {{
    const vendor = {vendor};
    const renderer = {renderer};
    const hook = (proto) => {{
      const original = proto.getParameter;
      proto.getParameter = function (parameter) {{
        if (parameter === {GL_UNMASKED_VENDOR}) return vendor;
        if (parameter === {GL_UNMASKED_RENDERER}) return renderer;
        return original.call(this, parameter);
      }};
    }};
    if (window.WebGLRenderingContext) hook(WebGLRenderingContext.prototype);
    if (window.WebGL2RenderingContext) hook(WebGL2RenderingContext.prototype);
  }} catch (e) {{}}

  window.__fp_noise = {noise};
}})();"#
    )
}
