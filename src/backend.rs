// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces of the external collaborators.
//!
//! The hardware codec, the surfaces it renders into and the GL layer are provided by the
//! platform. This module only describes the small part of them the backing strategy relies
//! on, so that the strategy can be driven by any implementation of these traits.

#[cfg(test)]
pub(crate) mod dummy;

use std::rc::Rc;

use thiserror::Error;

use crate::image::GlImage;
use crate::CodecBufferIndex;
use crate::ImageState;
use crate::Resolution;
use crate::SurfaceId;
use crate::TextureId;
use crate::TextureTarget;
use crate::TransformMatrix;

/// Error returned by collaborator methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("surface {0:?} is not available")]
    SurfaceUnavailable(SurfaceId),
    #[error("codec failed to release output buffer {0:?}")]
    CodecReleaseFailed(CodecBufferIndex),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by collaborator methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// The hardware video codec.
pub trait VideoCodecBridge {
    /// Returns the output buffer `index` to the codec. If `render` is true the buffer is first
    /// sent to the surface the codec outputs to. The hand-off to that surface is asynchronous.
    fn release_output_buffer(&self, index: CodecBufferIndex, render: bool) -> BackendResult<()>;
}

/// Callback invoked by a consumer surface each time a new frame has been queued to it. It may be
/// called from any thread.
pub type FrameAvailableCallback = Box<dyn Fn() + Send + Sync>;

/// A buffered sink the codec renders into, whose latest frame is exposed as an external texture.
pub trait ConsumerSurface {
    /// Latches the most recently queued frame into the texture.
    fn update_tex_image(&self) -> BackendResult<()>;

    /// Returns the texture coordinate transform of the latched frame.
    fn transform_matrix(&self) -> TransformMatrix;

    /// Installs `callback` as the frame availability listener, replacing any previous one.
    fn set_frame_available_callback(&self, callback: FrameAvailableCallback);
}

/// A GL context together with the surface it is made current against.
pub trait GlContext {
    /// Whether this context is current on the calling thread.
    fn is_current(&self) -> bool;

    /// Makes this context current. Returns false if the context has been lost.
    fn make_current(&self) -> bool;

    /// Returns the context that is current on the calling thread, which may be another one.
    fn current_on_thread(&self) -> Option<Rc<dyn GlContext>>;

    /// Leaves the calling thread without a current context.
    fn release_current(&self);

    /// Allocates a new texture name for `target`.
    fn gen_texture(&self, target: TextureTarget) -> Option<TextureId>;

    fn delete_texture(&self, texture: TextureId);

    /// Returns the texture currently bound to `target`, if any.
    fn bound_texture(&self, target: TextureTarget) -> Option<TextureId>;
}

/// Makes a context current for as long as it is alive, then restores whichever context was
/// current before, or none.
pub struct ScopedMakeCurrent {
    context: Rc<dyn GlContext>,
    /// `None` if `context` was already current and nothing needs restoring.
    previous: Option<Option<Rc<dyn GlContext>>>,
}

impl ScopedMakeCurrent {
    /// Returns `None` if `context` cannot be made current.
    pub fn new(context: &Rc<dyn GlContext>) -> Option<Self> {
        let previous = (!context.is_current()).then(|| context.current_on_thread());
        if !context.make_current() {
            return None;
        }

        Some(Self {
            context: context.clone(),
            previous,
        })
    }
}

impl Drop for ScopedMakeCurrent {
    fn drop(&mut self) {
        match self.previous.take() {
            None => (),
            Some(Some(previous)) => {
                if !previous.make_current() {
                    log::warn!("Failed to restore the previously current GL context");
                }
            }
            Some(None) => self.context.release_current(),
        }
    }
}

/// The GL command decoder the picture buffers belong to.
pub trait GlHost {
    /// Whether the command decoder still exists.
    fn is_alive(&self) -> bool;

    /// Returns the context that is current on the calling thread, or `None` if the decoder is
    /// gone or no context is current.
    fn current_context(&self) -> Option<Rc<dyn GlContext>>;
}

/// The texture backing a picture buffer, as seen through the texture manager.
pub trait TextureRef {
    fn service_id(&self) -> TextureId;

    /// Target the texture was allocated with.
    fn target(&self) -> TextureTarget;

    /// Sets the size of level 0 of the texture.
    fn set_level_info(&self, size: Resolution);

    /// Attaches `image` to level 0. `stream_texture` is the texture the image streams from when
    /// it is backed by a consumer surface. Passing `None` detaches any previous image.
    fn set_level_image(
        &self,
        image: Option<Rc<dyn GlImage>>,
        state: ImageState,
        stream_texture: Option<TextureId>,
    );

    fn set_level_image_state(&self, state: ImageState);

    /// Uploads tightly packed RGBA `pixels` of `size` into level 0.
    fn upload_rgba(&self, size: Resolution, pixels: &[u8]);
}

/// Source of the surfaces the codec can output to.
pub trait SurfaceProvider {
    /// Acquires the platform window surface `id` for direct rendering.
    fn acquire_surface(&self, id: SurfaceId) -> BackendResult<()>;

    /// Creates a consumer surface feeding `texture`.
    fn create_consumer_surface(&self, texture: TextureId)
        -> BackendResult<Rc<dyn ConsumerSurface>>;
}
