// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The image attached to each picture buffer texture.
//!
//! A [`CodecImage`] knows which codec buffer, if any, currently holds the frame of its picture
//! buffer, and releases it to the surface the codec outputs to when the frame must become
//! visible. With a consumer surface this happens in two steps: the codec buffer is first rendered
//! to the back buffer of the surface, then latched into the front buffer, i.e. the texture.
//! A direct surface only has the second step, done by the codec itself.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::backend::TextureRef;
use crate::backend::VideoCodecBridge;
use crate::backing::shared_state::SharedState;
use crate::image::GlImage;
use crate::CodecBufferIndex;
use crate::ImageState;
use crate::PictureBufferId;
use crate::Resolution;
use crate::TextureTarget;
use crate::TransformMatrix;

/// Where the frame of a picture buffer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecBufferState {
    /// No frame.
    Empty,
    /// The frame is in this codec buffer, which has not been released yet.
    Outstanding(CodecBufferIndex),
    /// The frame was released to the back buffer of the consumer surface.
    ReleasedBack,
    /// The frame is displayed.
    ReleasedFront,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    RenderToBack,
    RenderToFront,
}

pub struct CodecImage {
    picture_buffer_id: PictureBufferId,
    shared_state: Rc<SharedState>,
    codec: RefCell<Option<Rc<dyn VideoCodecBridge>>>,
    state: Cell<CodecBufferState>,
    size: Cell<Resolution>,
    /// The texture this image is attached to. The texture owns the image.
    texture: RefCell<Option<Weak<dyn TextureRef>>>,
}

impl CodecImage {
    pub fn new(
        picture_buffer_id: PictureBufferId,
        shared_state: Rc<SharedState>,
        codec: Option<Rc<dyn VideoCodecBridge>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            picture_buffer_id,
            shared_state,
            codec: RefCell::new(codec),
            state: Cell::new(CodecBufferState::Empty),
            size: Cell::new(Default::default()),
            texture: RefCell::new(None),
        })
    }

    pub fn picture_buffer_id(&self) -> PictureBufferId {
        self.picture_buffer_id
    }

    pub fn state(&self) -> CodecBufferState {
        self.state.get()
    }

    pub fn set_size(&self, size: Resolution) {
        self.size.set(size);
    }

    fn codec(&self) -> Option<Rc<dyn VideoCodecBridge>> {
        self.codec.borrow().clone()
    }

    fn texture(&self) -> Option<Rc<dyn TextureRef>> {
        self.texture.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Makes codec buffer `index`, holding a frame of `size`, the frame of this picture.
    pub fn assign_codec_buffer(&self, index: CodecBufferIndex, size: Resolution) {
        if let CodecBufferState::Outstanding(previous) = self.state.get() {
            log::warn!(
                "Picture {:?} still holds codec buffer {previous:?}, discarding it",
                self.picture_buffer_id
            );
            self.discard();
        }

        self.state.set(CodecBufferState::Outstanding(index));
        self.size.set(size);
    }

    /// Whether a codec buffer waits for this picture to decide of its fate.
    pub fn is_codec_buffer_outstanding(&self) -> bool {
        matches!(self.state.get(), CodecBufferState::Outstanding(_)) && self.codec.borrow().is_some()
    }

    pub fn was_promoted_to_back(&self) -> bool {
        self.state.get() == CodecBufferState::ReleasedBack
    }

    pub fn was_promoted_to_front(&self) -> bool {
        self.state.get() == CodecBufferState::ReleasedFront
    }

    /// Whether [`CodecImage::promote`] to the front buffer would change anything.
    pub(super) fn needs_promotion(&self) -> bool {
        match self.state.get() {
            CodecBufferState::Outstanding(_) | CodecBufferState::ReleasedBack => {
                self.codec.borrow().is_some()
            }
            CodecBufferState::Empty | CodecBufferState::ReleasedFront => false,
        }
    }

    /// Drops the frame of this picture without displaying it.
    pub fn discard(&self) {
        match self.state.get() {
            CodecBufferState::Empty => return,
            CodecBufferState::Outstanding(index) => {
                if let Some(codec) = self.codec() {
                    log::trace!("Discarding codec buffer {index:?}");
                    if let Err(e) = codec.release_output_buffer(index, false) {
                        log::warn!("Failed to discard codec buffer {index:?}: {e}");
                    }
                }
            }
            // Don't leave our release in flight.
            CodecBufferState::ReleasedBack => {
                if self.shared_state.has_pending_release() {
                    self.shared_state.wait_for_frame_available();
                }
            }
            CodecBufferState::ReleasedFront => (),
        }

        self.state.set(CodecBufferState::Empty);
    }

    /// Moves the frame of this picture to the back or front buffer. Does nothing if the frame is
    /// already there or further, or if there is no codec.
    pub fn promote(&self, promotion: Promotion) {
        let Some(codec) = self.codec() else {
            return;
        };

        match self.state.get() {
            CodecBufferState::Outstanding(index) if self.shared_state.has_consumer_surface() => {
                self.shared_state
                    .render_codec_buffer_to_consumer(codec.as_ref(), index);
                self.state.set(CodecBufferState::ReleasedBack);

                if promotion == Promotion::RenderToFront {
                    self.promote_back_to_front();
                }
            }
            CodecBufferState::Outstanding(index) => {
                // Direct surfaces have no back buffer.
                if promotion == Promotion::RenderToBack {
                    log::error!("Cannot render to the back buffer of a direct surface");
                    debug_assert!(false, "back buffer rendering without a consumer surface");
                    return;
                }

                log::trace!("Rendering codec buffer {index:?} to the direct surface");
                if let Err(e) = codec.release_output_buffer(index, true) {
                    log::warn!("Failed to render codec buffer {index:?}: {e}");
                }
                self.state.set(CodecBufferState::ReleasedFront);
                self.shared_state.set_front_picture(self.picture_buffer_id);
            }
            CodecBufferState::ReleasedBack if promotion == Promotion::RenderToFront => {
                self.promote_back_to_front()
            }
            _ => (),
        }
    }

    fn promote_back_to_front(&self) {
        if self.shared_state.has_pending_release() {
            self.shared_state.wait_for_frame_available();
        }
        self.shared_state.promote_latest_frame();

        log::trace!("Picture {:?} is in the front buffer", self.picture_buffer_id);
        self.state.set(CodecBufferState::ReleasedFront);
        self.shared_state.set_front_picture(self.picture_buffer_id);
    }

    /// Another picture took the front buffer.
    pub(super) fn supersede(&self) {
        if self.state.get() == CodecBufferState::ReleasedFront {
            self.state.set(CodecBufferState::Empty);
        }
    }

    /// Switches to `codec`. Any codec buffer of the previous codec is forgotten, it must not be
    /// released to the new one.
    pub fn codec_changed(&self, codec: Option<Rc<dyn VideoCodecBridge>>) {
        *self.codec.borrow_mut() = codec;
        self.state.set(CodecBufferState::Empty);
    }

    /// Attaches this image to level 0 of `texture`.
    ///
    /// With a consumer surface the texture streams from the consumer texture. Otherwise the frames
    /// never reach the texture, so it gets a transparent pixel to let whatever is below, i.e. the
    /// direct surface, show through.
    pub fn attach_to_texture(self: &Rc<Self>, texture: &Rc<dyn TextureRef>, have_context: bool) {
        *self.texture.borrow_mut() = Some(Rc::downgrade(texture));
        texture.set_level_info(self.size.get());

        let image: Rc<dyn GlImage> = self.clone();
        if self.shared_state.has_consumer_surface() {
            texture.set_level_image(
                Some(image),
                ImageState::Unbound,
                self.shared_state.consumer_texture(),
            );
        } else {
            if have_context {
                texture.upload_rgba(Resolution::from((1, 1)), &[0, 0, 0, 0]);
            }
            texture.set_level_image(Some(image), ImageState::Bound, None);
        }
    }
}

impl GlImage for CodecImage {
    fn size(&self) -> Resolution {
        self.size.get()
    }

    fn bind_tex_image(&self, _target: TextureTarget) -> bool {
        false
    }

    fn copy_tex_image(&self, target: TextureTarget) -> bool {
        if !self.shared_state.has_consumer_surface() || target != TextureTarget::External {
            return false;
        }

        // The consumer texture must be the one being sampled.
        let bound = self
            .shared_state
            .context()
            .and_then(|context| context.bound_texture(target));
        match (bound, self.shared_state.consumer_texture()) {
            (Some(bound), Some(consumer)) if bound == consumer => (),
            _ => return false,
        }

        self.promote(Promotion::RenderToFront);

        // Keep the level unbound so that we are called again on the next sample.
        if let Some(texture) = self.texture() {
            texture.set_level_image_state(ImageState::Unbound);
        }

        true
    }

    fn texture_matrix(&self) -> TransformMatrix {
        if self.shared_state.has_consumer_surface() {
            self.promote(Promotion::RenderToFront);
        }

        self.shared_state.transform_matrix()
    }

    fn schedule_overlay_plane(&self) -> bool {
        if self.shared_state.has_consumer_surface() {
            log::debug!(
                "Picture {:?} is backed by a consumer surface and cannot be overlaid",
                self.picture_buffer_id
            );
            return false;
        }

        self.promote(Promotion::RenderToFront);
        true
    }

    fn destroy(&self, _have_context: bool) {
        self.discard();
    }
}

impl Drop for CodecImage {
    fn drop(&mut self) {
        self.shared_state.forget_image(self.picture_buffer_id);
    }
}
