// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backing strategy that defers rendering of codec buffers until their picture is displayed.
//!
//! Decoded codec buffers are not copied into the picture buffers. Instead each picture buffer
//! texture is backed by a [`CodecImage`] that releases its codec buffer to the codec's output
//! surface once the picture is actually drawn. Since releasing is asynchronous and can take a
//! while, the strategy renders early whatever it safely can: the oldest picture waiting for
//! display goes to the front buffer, and the picture following it to the back buffer of the
//! consumer surface.

use std::rc::Rc;

use crate::backend::GlHost;
use crate::backend::SurfaceProvider;
use crate::backend::VideoCodecBridge;
use crate::backing::codec_image::CodecImage;
use crate::backing::codec_image::Promotion;
use crate::backing::shared_state::SharedState;
use crate::backing::BackingError;
use crate::backing::BackingOptions;
use crate::backing::BackingStrategy;
use crate::backing::OutputSurface;
use crate::backing::PictureBuffer;
use crate::backing::Result;
use crate::backing::SurfaceKind;
use crate::CodecBufferIndex;
use crate::ImageState;
use crate::PictureBufferId;
use crate::Resolution;
use crate::TextureTarget;

pub struct DeferredBackingStrategy {
    gl_host: Rc<dyn GlHost>,
    surfaces: Rc<dyn SurfaceProvider>,
    options: BackingOptions,
    /// Set between `initialize` and `cleanup`.
    shared_state: Option<Rc<SharedState>>,
    codec: Option<Rc<dyn VideoCodecBridge>>,
    /// Pictures holding a frame the client has not returned yet, oldest first.
    pictures_out_for_display: Vec<PictureBufferId>,
    picture_buffer_size: Resolution,
}

impl DeferredBackingStrategy {
    pub fn new(
        gl_host: Rc<dyn GlHost>,
        surfaces: Rc<dyn SurfaceProvider>,
        options: BackingOptions,
    ) -> Self {
        Self {
            gl_host,
            surfaces,
            options,
            shared_state: None,
            codec: None,
            pictures_out_for_display: Vec::new(),
            picture_buffer_size: Default::default(),
        }
    }

    pub fn pictures_out_for_display(&self) -> &[PictureBufferId] {
        &self.pictures_out_for_display
    }

    pub fn shared_state(&self) -> Option<&Rc<SharedState>> {
        self.shared_state.as_ref()
    }

    /// Renders the pictures out for display as far as possible without changing which frame is
    /// visible out of order.
    ///
    /// The front buffer goes to the oldest picture following the last displayed one, unless some
    /// picture is displayed already. Then, with a consumer surface, the picture following the
    /// displayed one is rendered to the back buffer if the back buffer is free.
    fn maybe_render_early(&self, state: &SharedState) {
        let images: Vec<Option<Rc<CodecImage>>> = self
            .pictures_out_for_display
            .iter()
            .map(|id| state.image_for_picture(*id))
            .collect();

        let mut front = None;
        let mut candidate = None;
        for (i, image) in images.iter().enumerate().rev() {
            let Some(image) = image else {
                continue;
            };

            if image.was_promoted_to_front() {
                front = Some(i);
                candidate = None;
                break;
            }

            if image.needs_promotion() {
                candidate = Some(i);
            }
        }

        if let Some(i) = candidate {
            if let Some(image) = &images[i] {
                log::trace!("Rendering picture {:?} early", image.picture_buffer_id());
                image.promote(Promotion::RenderToFront);
            }
            front = Some(i);
        }

        // Direct surfaces have no back buffer.
        if !state.has_consumer_surface() {
            return;
        }
        let Some(front) = front else {
            return;
        };

        let mut following = images[front + 1..].iter().flatten();
        if following.clone().any(|image| image.was_promoted_to_back()) {
            return;
        }
        if let Some(next) = following.find(|image| image.is_codec_buffer_outstanding()) {
            log::trace!(
                "Rendering picture {:?} to the back buffer",
                next.picture_buffer_id()
            );
            next.promote(Promotion::RenderToBack);
        }
    }
}

impl BackingStrategy for DeferredBackingStrategy {
    fn initialize(&mut self, kind: SurfaceKind) -> Result<OutputSurface> {
        if self.shared_state.is_some() {
            log::error!("Backing strategy is already initialized");
            debug_assert!(false, "backing strategy initialized twice");
            return Err(BackingError::AlreadyInitialized);
        }

        let shared_state = SharedState::new(&self.options)?;

        let surface = match kind {
            SurfaceKind::Direct(id) => {
                self.surfaces.acquire_surface(id)?;
                log::debug!("Rendering directly to surface {id:?}");
                OutputSurface::Direct(id)
            }
            SurfaceKind::Consumer => {
                let context = self
                    .gl_host
                    .current_context()
                    .ok_or(BackingError::NoGlContext)?;
                let texture = context
                    .gen_texture(TextureTarget::External)
                    .ok_or(BackingError::TextureAllocation)?;

                let surface = match self.surfaces.create_consumer_surface(texture) {
                    Ok(surface) => surface,
                    Err(e) => {
                        context.delete_texture(texture);
                        return Err(e.into());
                    }
                };

                shared_state.attach_consumer_surface(surface.clone(), texture, context);
                OutputSurface::Consumer(surface)
            }
        };

        self.shared_state = Some(shared_state);
        Ok(surface)
    }

    fn cleanup(&mut self, have_context: bool, buffers: &[PictureBuffer]) {
        let Some(state) = self.shared_state.take() else {
            return;
        };

        log::debug!(
            "Cleaning up, {} pictures out for display",
            self.pictures_out_for_display.len()
        );

        // Never render while tearing down.
        for id in self.pictures_out_for_display.drain(..) {
            if let Some(image) = state.image_for_picture(id) {
                image.discard();
            }
        }

        if have_context {
            for buffer in buffers {
                buffer
                    .texture
                    .set_level_image(None, ImageState::Unbound, None);
            }
        }

        state.release_gl_resources(have_context);
    }

    fn texture_target(&self) -> TextureTarget {
        match &self.shared_state {
            Some(state) if state.has_consumer_surface() => TextureTarget::External,
            _ => TextureTarget::Tex2D,
        }
    }

    fn picture_buffer_size(&self) -> Resolution {
        self.picture_buffer_size
    }

    fn set_picture_buffer_size(&mut self, size: Resolution) {
        self.picture_buffer_size = size;
    }

    fn attach_picture_buffer(&mut self, buffer: &PictureBuffer, have_context: bool) {
        let Some(state) = &self.shared_state else {
            log::error!("Cannot attach picture {:?} before initialization", buffer.id);
            return;
        };

        if buffer.texture.target() != self.texture_target() {
            log::error!(
                "Picture {:?} has a {:?} texture, expected {:?}",
                buffer.id,
                buffer.texture.target(),
                self.texture_target()
            );
            debug_assert!(false, "picture texture has the wrong target");
            return;
        }

        log::debug!(
            "Attaching picture {:?} to texture {:?}",
            buffer.id,
            buffer.texture.service_id()
        );

        let image = CodecImage::new(buffer.id, state.clone(), self.codec.clone());
        image.set_size(buffer.size);
        state.set_image_for_picture(buffer.id, &image);
        image.attach_to_texture(&buffer.texture, have_context);
    }

    fn assign_picture_buffer(
        &mut self,
        id: PictureBufferId,
        index: CodecBufferIndex,
    ) -> Result<()> {
        let Some(state) = self.shared_state.clone() else {
            return Err(BackingError::NotInitialized);
        };

        if !self.gl_host.is_alive() {
            log::warn!("GL host is gone, dropping codec buffer {index:?}");
            if let Some(codec) = &self.codec {
                codec.release_output_buffer(index, false)?;
            }
            return Ok(());
        }

        let Some(image) = state.image_for_picture(id) else {
            log::error!("Codec buffer {index:?} assigned to unknown picture {id:?}");
            debug_assert!(false, "unknown picture buffer {:?}", id);
            return Err(BackingError::UnknownPicture(id));
        };

        if self.pictures_out_for_display.contains(&id) {
            log::warn!("Picture {id:?} is already out for display, dropping {index:?}");
            if let Some(codec) = &self.codec {
                codec.release_output_buffer(index, false)?;
            }
            return Err(BackingError::AlreadyOutForDisplay(id));
        }

        log::trace!("Assigning codec buffer {index:?} to picture {id:?}");
        image.assign_codec_buffer(index, self.picture_buffer_size);
        self.pictures_out_for_display.push(id);

        self.maybe_render_early(&state);
        Ok(())
    }

    fn reclaim_picture_buffer(&mut self, id: PictureBufferId) {
        let Some(state) = self.shared_state.clone() else {
            return;
        };

        self.pictures_out_for_display.retain(|p| *p != id);
        if let Some(image) = state.image_for_picture(id) {
            image.discard();
        }

        // The back buffer may be free now.
        self.maybe_render_early(&state);
    }

    fn release_codec_buffers(&mut self, buffers: &[PictureBuffer]) {
        let Some(state) = &self.shared_state else {
            return;
        };

        for buffer in buffers {
            if let Some(image) = state.image_for_picture(buffer.id) {
                image.discard();
            }
        }
    }

    fn codec_changed(&mut self, codec: Option<Rc<dyn VideoCodecBridge>>) {
        log::debug!("Codec changed, has codec: {}", codec.is_some());
        self.codec = codec;

        if let Some(state) = &self.shared_state {
            state.forget_pending_release();
            for image in state.images() {
                image.codec_changed(self.codec.clone());
            }
        }
    }

    fn on_frame_available(&self) {
        if let Some(state) = &self.shared_state {
            state.signal_frame_available();
        }
    }

    fn is_overlay_eligible(&self) -> bool {
        self.shared_state
            .as_ref()
            .is_some_and(|state| !state.has_consumer_surface())
    }

    fn update_picture_buffer_size(&mut self, buffer: &mut PictureBuffer, size: Resolution) {
        buffer.size = size;
        buffer.texture.set_level_info(size);

        if let Some(image) = self
            .shared_state
            .as_ref()
            .and_then(|state| state.image_for_picture(buffer.id))
        {
            image.set_size(size);
        }
    }
}
