// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backing strategies.
//!
//! A backing strategy decides how decoded codec buffers end up in the picture buffers handed
//! to the client. The decoder driver creates one per session, calls
//! [`BackingStrategy::initialize`] to obtain the surface the codec must render to, and then
//! reports each decoded output with [`BackingStrategy::assign_picture_buffer`] and each picture
//! the client is done with with [`BackingStrategy::reclaim_picture_buffer`].
//!
//! [`deferred::DeferredBackingStrategy`] defers the actual rendering of a codec buffer until the
//! picture is about to be displayed, using the types of the [`shared_state`] and
//! [`codec_image`] modules.

pub mod codec_image;
pub mod deferred;
pub mod shared_state;

use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::ConsumerSurface;
use crate::backend::TextureRef;
use crate::backend::VideoCodecBridge;
use crate::CodecBufferIndex;
use crate::PictureBufferId;
use crate::Resolution;
use crate::SurfaceId;
use crate::TextureTarget;

/// How long a front buffer promotion waits for the consumer surface to report the frame it is
/// promoting. Notifications are not delivered reliably on all devices so the wait must be
/// short. 5ms covers the vast majority of deliveries.
pub const DEFAULT_FRAME_WAIT_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct BackingOptions {
    /// Upper bound of a frame availability wait, measured from the codec buffer release.
    pub frame_wait_timeout: Duration,
}

impl Default for BackingOptions {
    fn default() -> Self {
        Self {
            frame_wait_timeout: DEFAULT_FRAME_WAIT_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum BackingError {
    #[error("backing strategy is already initialized")]
    AlreadyInitialized,
    #[error("backing strategy is not initialized")]
    NotInitialized,
    #[error("no GL context is current")]
    NoGlContext,
    #[error("failed to allocate a texture for the consumer surface")]
    TextureAllocation,
    #[error("failed to create frame availability event: {0}")]
    FrameEvent(Errno),
    #[error("picture buffer {0:?} is unknown")]
    UnknownPicture(PictureBufferId),
    #[error("picture buffer {0:?} is already out for display")]
    AlreadyOutForDisplay(PictureBufferId),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, BackingError>;

/// Where the codec should render its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Render straight to the platform window surface with this id.
    Direct(SurfaceId),
    /// Render to a consumer surface whose frames are sampled as an external texture.
    Consumer,
}

/// Surface returned by [`BackingStrategy::initialize`], to be configured on the codec.
#[derive(Clone)]
pub enum OutputSurface {
    Direct(SurfaceId),
    Consumer(Rc<dyn ConsumerSurface>),
}

impl std::fmt::Debug for OutputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSurface::Direct(id) => f.debug_tuple("Direct").field(id).finish(),
            OutputSurface::Consumer(_) => f.write_str("Consumer"),
        }
    }
}

/// A picture buffer, as allocated by the decoder driver and shared with the client.
#[derive(Clone)]
pub struct PictureBuffer {
    pub id: PictureBufferId,
    pub size: Resolution,
    pub texture: Rc<dyn TextureRef>,
}

/// Interface between the decoder driver and the way decoded frames are attached to picture
/// buffers.
pub trait BackingStrategy {
    /// Prepares the surface the codec renders to and returns it.
    fn initialize(&mut self, kind: SurfaceKind) -> Result<OutputSurface>;

    /// Ends the session. Every codec buffer still held is discarded, and the picture textures in
    /// `buffers` are detached from their images if `have_context` is set.
    fn cleanup(&mut self, have_context: bool, buffers: &[PictureBuffer]);

    /// Texture target picture buffers must be allocated with.
    fn texture_target(&self) -> TextureTarget;

    /// Size new picture buffers and decoded frames are tagged with.
    fn picture_buffer_size(&self) -> Resolution;

    fn set_picture_buffer_size(&mut self, size: Resolution);

    /// Creates the image backing `buffer` and attaches it to the buffer's texture.
    fn attach_picture_buffer(&mut self, buffer: &PictureBuffer, have_context: bool);

    /// Hands the decoded codec buffer `index` over to picture `id`, which is now out for display.
    fn assign_picture_buffer(&mut self, id: PictureBufferId, index: CodecBufferIndex)
        -> Result<()>;

    /// Called when the client returns picture `id` for reuse.
    fn reclaim_picture_buffer(&mut self, id: PictureBufferId);

    /// Discards the codec buffers held by `buffers`, e.g. on flush.
    fn release_codec_buffers(&mut self, buffers: &[PictureBuffer]);

    /// Called when the codec has been replaced. `None` means there is no codec anymore.
    fn codec_changed(&mut self, codec: Option<Rc<dyn VideoCodecBridge>>);

    /// Called by the driver when it learns a new frame reached the consumer surface.
    fn on_frame_available(&self);

    /// Whether pictures are displayed as overlays rather than composited as textures.
    fn is_overlay_eligible(&self) -> bool;

    /// Records `size` as the new size of `buffer`.
    fn update_picture_buffer_size(&mut self, buffer: &mut PictureBuffer, size: Resolution);
}
