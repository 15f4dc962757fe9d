// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! State shared between a backing strategy and all the images of its session.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::backend::ConsumerSurface;
use crate::backend::GlContext;
use crate::backend::ScopedMakeCurrent;
use crate::backend::VideoCodecBridge;
use crate::backing::codec_image::CodecImage;
use crate::backing::BackingError;
use crate::backing::BackingOptions;
use crate::CodecBufferIndex;
use crate::PictureBufferId;
use crate::TextureId;
use crate::TransformMatrix;
use crate::Y_INVERTED_IDENTITY;

/// Binary event signaled when the consumer surface receives a frame.
///
/// A successful wait consumes the signal.
pub struct FrameAvailableEvent {
    event: EventFd,
    epoll: Epoll,
}

impl FrameAvailableEvent {
    pub fn new() -> Result<Self, Errno> {
        let event =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))?;

        Ok(Self { event, epoll })
    }

    /// Signals the event. Can be called from any thread.
    pub fn signal(&self) {
        if let Err(e) = self.event.write(1) {
            log::warn!("Failed to signal frame availability: {e}");
        }
    }

    /// Clears any pending signal.
    pub fn reset(&self) {
        match self.event.read() {
            Ok(_) | Err(Errno::EAGAIN) => (),
            Err(e) => log::warn!("Failed to reset frame availability event: {e}"),
        }
    }

    /// Waits up to `timeout` for the event to be signaled. Returns true if it was, in which case
    /// the signal is consumed. A zero `timeout` only polls.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let millis = u16::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(u16::MAX);
        let mut events = [EpollEvent::empty()];

        match self.epoll.wait(&mut events, EpollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => false,
            Ok(_) => {
                self.reset();
                true
            }
            Err(e) => {
                log::warn!("Failed to wait for frame availability: {e}");
                false
            }
        }
    }
}

/// Receives the frame availability notifications of a consumer surface.
///
/// The consumer surface keeps the handler alive for as long as it wants, possibly longer than the
/// session. [`FrameAvailableHandler::detach`] severs the handler from the session's event; once it
/// returns no notification can reach the event anymore.
pub struct FrameAvailableHandler {
    listener: Mutex<Option<Arc<FrameAvailableEvent>>>,
}

impl FrameAvailableHandler {
    fn new(event: Arc<FrameAvailableEvent>) -> Arc<Self> {
        Arc::new(Self {
            listener: Mutex::new(Some(event)),
        })
    }

    /// Called by the consumer surface, from any thread.
    pub fn on_frame_available(&self) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(event) = listener.as_ref() {
            event.signal();
        }
    }

    pub fn detach(&self) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Counters about bounded frame availability waits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameWaitStats {
    pub waits: u64,
    pub timeouts: u64,
}

/// The consumer surface a session renders to and the GL context owning its texture. Either both
/// or none of them are present.
struct ConsumerBinding {
    surface: Rc<dyn ConsumerSurface>,
    context: Rc<dyn GlContext>,
    handler: Arc<FrameAvailableHandler>,
}

/// State shared by a backing strategy and all the images of a decoding session.
///
/// Owned jointly by the strategy and every [`CodecImage`]. The images are only referenced weakly,
/// through the picture id map.
pub struct SharedState {
    consumer: RefCell<Option<ConsumerBinding>>,
    /// Texture the consumer surface feeds. Cleared once deleted.
    consumer_texture: Cell<Option<TextureId>>,
    frame_available: Arc<FrameAvailableEvent>,
    images: RefCell<BTreeMap<PictureBufferId, Weak<CodecImage>>>,
    /// Picture whose frame is currently displayed.
    front_picture: Cell<Option<PictureBufferId>>,
    transform_matrix: Cell<TransformMatrix>,
    /// Time of the last codec buffer release to the consumer surface whose frame we have not
    /// waited for yet.
    release_time: Cell<Option<Instant>>,
    frame_wait_timeout: Duration,
    stats: Cell<FrameWaitStats>,
}

impl SharedState {
    pub fn new(options: &BackingOptions) -> Result<Rc<Self>, BackingError> {
        let frame_available = FrameAvailableEvent::new().map_err(BackingError::FrameEvent)?;

        Ok(Rc::new(Self {
            consumer: RefCell::new(None),
            consumer_texture: Cell::new(None),
            frame_available: Arc::new(frame_available),
            images: RefCell::new(BTreeMap::new()),
            front_picture: Cell::new(None),
            transform_matrix: Cell::new(Y_INVERTED_IDENTITY),
            release_time: Cell::new(None),
            frame_wait_timeout: options.frame_wait_timeout,
            stats: Cell::new(Default::default()),
        }))
    }

    /// Binds the session to `surface`, which feeds `texture` owned by `context`, and starts
    /// listening to its frame availability notifications.
    pub fn attach_consumer_surface(
        &self,
        surface: Rc<dyn ConsumerSurface>,
        texture: TextureId,
        context: Rc<dyn GlContext>,
    ) {
        let mut consumer = self.consumer.borrow_mut();
        if consumer.is_some() {
            log::error!("A consumer surface is already attached");
            debug_assert!(false, "consumer surface attached twice");
            return;
        }

        let handler = FrameAvailableHandler::new(self.frame_available.clone());
        let listener = handler.clone();
        surface.set_frame_available_callback(Box::new(move || listener.on_frame_available()));

        log::debug!("Attached consumer surface feeding texture {texture:?}");
        *consumer = Some(ConsumerBinding {
            surface,
            context,
            handler,
        });
        self.consumer_texture.set(Some(texture));
    }

    pub fn has_consumer_surface(&self) -> bool {
        self.consumer.borrow().is_some()
    }

    /// Texture fed by the consumer surface, if it is still allocated.
    pub fn consumer_texture(&self) -> Option<TextureId> {
        self.consumer_texture.get()
    }

    /// Context owning the consumer surface texture.
    pub fn context(&self) -> Option<Rc<dyn GlContext>> {
        self.consumer.borrow().as_ref().map(|c| c.context.clone())
    }

    /// Signals that a frame reached the consumer surface. Can be called from any thread that
    /// holds a handler; this method itself is for the session's thread.
    pub fn signal_frame_available(&self) {
        self.frame_available.signal();
    }

    /// Whether a codec buffer was released to the consumer surface and not waited for yet.
    pub fn has_pending_release(&self) -> bool {
        self.release_time.get().is_some()
    }

    /// Forgets the pending release, if any. Its notification belongs to a codec that is gone and
    /// must not delay the first release of the next one.
    pub fn forget_pending_release(&self) {
        if self.release_time.take().is_some() {
            log::debug!("Dropping the pending release of the previous codec");
        }
    }

    /// Waits for the frame of the last release to reach the consumer surface, for at most the
    /// configured timeout counted from the release.
    pub fn wait_for_frame_available(&self) {
        let Some(release_time) = self.release_time.take() else {
            log::error!("Waiting for a frame without a pending release");
            debug_assert!(false, "no pending release to wait for");
            return;
        };

        let mut stats = self.stats.get();
        stats.waits += 1;

        let elapsed = release_time.elapsed();
        let remaining = self.frame_wait_timeout.saturating_sub(elapsed);
        // A zero wait still consumes a signal that arrived in time.
        if !self.frame_available.timed_wait(remaining) {
            stats.timeouts += 1;
            log::debug!(
                "Frame availability wait timed out, {:?} after release",
                release_time.elapsed()
            );
        }

        self.stats.set(stats);
    }

    /// Releases codec buffer `index` to the consumer surface. Releases are serialized: if the
    /// previous one has not been waited for, wait for it first.
    pub fn render_codec_buffer_to_consumer(
        &self,
        codec: &dyn VideoCodecBridge,
        index: CodecBufferIndex,
    ) {
        if self.has_pending_release() {
            self.wait_for_frame_available();
        }

        // Only notifications for this release must satisfy the next wait.
        self.frame_available.reset();

        log::trace!("Rendering codec buffer {index:?} to the consumer surface");
        match codec.release_output_buffer(index, true) {
            Ok(()) => self.release_time.set(Some(Instant::now())),
            Err(e) => log::warn!("Failed to render codec buffer {index:?}: {e}"),
        }
    }

    /// Latches the latest frame of the consumer surface and refreshes the transform matrix.
    pub fn promote_latest_frame(&self) {
        let consumer = self.consumer.borrow();
        let Some(binding) = consumer.as_ref() else {
            log::error!("Cannot promote a frame without a consumer surface");
            debug_assert!(false, "no consumer surface");
            return;
        };

        let Some(_current) = ScopedMakeCurrent::new(&binding.context) else {
            log::warn!("Failed to make the consumer surface context current");
            return;
        };

        if let Err(e) = binding.surface.update_tex_image() {
            log::warn!("Failed to update the consumer surface texture: {e}");
            return;
        }
        self.transform_matrix.set(binding.surface.transform_matrix());
    }

    /// Transform of the latest promoted frame.
    pub fn transform_matrix(&self) -> TransformMatrix {
        self.transform_matrix.get()
    }

    pub fn frame_wait_stats(&self) -> FrameWaitStats {
        self.stats.get()
    }

    /// Registers `image` for picture `id`, replacing any previous image.
    pub fn set_image_for_picture(&self, id: PictureBufferId, image: &Rc<CodecImage>) {
        self.images.borrow_mut().insert(id, Rc::downgrade(image));
    }

    pub fn image_for_picture(&self, id: PictureBufferId) -> Option<Rc<CodecImage>> {
        self.images.borrow().get(&id).and_then(Weak::upgrade)
    }

    /// All live images of the session.
    pub fn images(&self) -> Vec<Rc<CodecImage>> {
        self.images
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Removes the entry of picture `id` if its image is gone.
    pub(super) fn forget_image(&self, id: PictureBufferId) {
        let mut images = self.images.borrow_mut();
        if images.get(&id).is_some_and(|image| image.strong_count() == 0) {
            images.remove(&id);
        }
    }

    /// Records that picture `id` is now displayed. The previously displayed picture, if any, no
    /// longer is.
    pub(super) fn set_front_picture(&self, id: PictureBufferId) {
        let previous = self.front_picture.replace(Some(id));
        if let Some(previous) = previous.filter(|p| *p != id) {
            if let Some(image) = self.image_for_picture(previous) {
                image.supersede();
            }
        }
    }

    /// Stops listening to the consumer surface and deletes its texture if `have_context` is set
    /// and the owning context can be made current. Safe to call more than once.
    pub fn release_gl_resources(&self, have_context: bool) {
        let consumer = self.consumer.borrow();
        let Some(binding) = consumer.as_ref() else {
            return;
        };

        binding.handler.detach();

        let Some(texture) = self.consumer_texture.take() else {
            return;
        };
        match have_context
            .then(|| ScopedMakeCurrent::new(&binding.context))
            .flatten()
        {
            Some(_current) => {
                log::debug!("Deleting consumer surface texture {texture:?}");
                binding.context.delete_texture(texture);
            }
            None => log::debug!("No context to delete consumer surface texture {texture:?}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_release_time(&self, time: Instant) {
        self.release_time.set(Some(time));
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        self.release_gl_resources(true);
    }
}
