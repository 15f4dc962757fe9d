// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deferred rendering of hardware video decoder output into GPU picture buffers.
//!
//! A hardware decoder hands out decoded frames as codec buffer indices that must each be
//! released, either discarded or rendered to the surface the codec outputs to. This crate
//! multiplexes those buffers across a pool of GPU picture buffers:
//!
//! * [`backing::shared_state::SharedState`] holds the per-session state shared by everyone:
//!   the consumer surface and its texture, the cross-thread frame availability event and the
//!   picture id to image map.
//! * [`backing::codec_image::CodecImage`] tracks the codec buffer assigned to one picture
//!   buffer and drives its release to the back or front buffer of the consumer surface.
//! * [`backing::deferred::DeferredBackingStrategy`] is what the decoder driver talks to. It
//!   keeps the pictures that are out for display in render order and promotes them early so
//!   that the asynchronous codec release latency stays hidden.
//!
//! The codec, the GL layer and the surfaces are external and only seen through the traits of
//! the [`backend`] module.

pub mod backend;
pub mod backing;
pub mod image;

/// A 4x4 column-major texture coordinate transform.
pub type TransformMatrix = [f32; 16];

/// Identity with the Y axis flipped, used until a consumer surface reports its own transform.
pub const Y_INVERTED_IDENTITY: TransformMatrix = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 1.0, 0.0, 1.0, //
];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Identifier of a picture buffer, as allocated by the decoder driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PictureBufferId(pub i32);

/// Index of a decoded output buffer owned by the codec until it is released.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodecBufferIndex(pub usize);

/// Service-side name of a GL texture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureId(pub u32);

/// Identifier of a platform window surface the codec can render to directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub i32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextureTarget {
    /// Regular 2D texture.
    Tex2D,
    /// External (stream) texture fed by a consumer surface.
    External,
}

/// How a texture level relates to the image attached to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageState {
    /// The image must be copied into the texture before each sample.
    Unbound,
    /// The texture already holds the image contents.
    Bound,
}
