//! f32 math shim: std on host builds, `libm` on `no_std` targets.

#[cfg(feature = "std")]
pub fn sqrtf(x: f32) -> f32 {
    x.sqrt()
}
#[cfg(not(feature = "std"))]
pub fn sqrtf(x: f32) -> f32 {
    libm::sqrtf(x)
}

#[cfg(feature = "std")]
pub fn sinf(x: f32) -> f32 {
    x.sin()
}
#[cfg(not(feature = "std"))]
pub fn sinf(x: f32) -> f32 {
    libm::sinf(x)
}

#[cfg(feature = "std")]
pub fn cosf(x: f32) -> f32 {
    x.cos()
}
#[cfg(not(feature = "std"))]
pub fn cosf(x: f32) -> f32 {
    libm::cosf(x)
}

#[cfg(feature = "std")]
pub fn ceilf(x: f32) -> f32 {
    x.ceil()
}
#[cfg(not(feature = "std"))]
pub fn ceilf(x: f32) -> f32 {
    libm::ceilf(x)
}

#[cfg(feature = "std")]
pub fn fabsf(x: f32) -> f32 {
    x.abs()
}
#[cfg(not(feature = "std"))]
pub fn fabsf(x: f32) -> f32 {
    libm::fabsf(x)
}
