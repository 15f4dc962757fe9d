// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains dummy collaborators whose only purpose is to let the backing strategy
//! run so we can test it in isolation. They record the calls they receive in a shared
//! [`CallLog`] so tests can check ordering across collaborators.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::ConsumerSurface;
use crate::backend::FrameAvailableCallback;
use crate::backend::GlContext;
use crate::backend::GlHost;
use crate::backend::SurfaceProvider;
use crate::backend::TextureRef;
use crate::backend::VideoCodecBridge;
use crate::image::GlImage;
use crate::CodecBufferIndex;
use crate::ImageState;
use crate::Resolution;
use crate::SurfaceId;
use crate::TextureId;
use crate::TextureTarget;
use crate::TransformMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Release { index: usize, render: bool },
    UpdateTexImage,
    DeleteTexture(u32),
}

#[derive(Default, Clone)]
pub struct CallLog(Rc<RefCell<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().clone()
    }

    pub fn releases(&self) -> Vec<(usize, bool)> {
        self.0
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Release { index, render } => Some((*index, *render)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// Codec that records releases. Rendered buffers are reported to `render_target`, if set, the
/// way a real consumer surface would be notified of a new frame.
pub struct Codec {
    log: CallLog,
    pub render_target: RefCell<Option<Rc<Surface>>>,
}

impl Codec {
    pub fn new(log: &CallLog) -> Rc<Self> {
        Rc::new(Self {
            log: log.clone(),
            render_target: RefCell::new(None),
        })
    }
}

impl VideoCodecBridge for Codec {
    fn release_output_buffer(&self, index: CodecBufferIndex, render: bool) -> BackendResult<()> {
        self.log.push(Call::Release {
            index: index.0,
            render,
        });
        if render {
            if let Some(surface) = self.render_target.borrow().as_ref() {
                surface.fire_frame_available();
            }
        }
        Ok(())
    }
}

pub struct Surface {
    log: CallLog,
    callback: RefCell<Option<Arc<dyn Fn() + Send + Sync>>>,
    pub matrix: Cell<TransformMatrix>,
    pub fail_updates: Cell<bool>,
}

impl Surface {
    pub fn new(log: &CallLog) -> Rc<Self> {
        Rc::new(Self {
            log: log.clone(),
            callback: RefCell::new(None),
            matrix: Cell::new([0.5; 16]),
            fail_updates: Cell::new(false),
        })
    }

    /// Returns the registered frame availability callback, so it can be moved to another thread.
    pub fn callback(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        self.callback.borrow().clone()
    }

    pub fn fire_frame_available(&self) {
        if let Some(callback) = self.callback() {
            callback();
        }
    }
}

impl ConsumerSurface for Surface {
    fn update_tex_image(&self) -> BackendResult<()> {
        if self.fail_updates.get() {
            return Err(BackendError::Other(anyhow::anyhow!("surface abandoned")));
        }
        self.log.push(Call::UpdateTexImage);
        Ok(())
    }

    fn transform_matrix(&self) -> TransformMatrix {
        self.matrix.get()
    }

    fn set_frame_available_callback(&self, callback: FrameAvailableCallback) {
        *self.callback.borrow_mut() = Some(Arc::from(callback));
    }
}

/// The context current on a simulated thread, shared by all contexts created on it.
type CurrentContext = Rc<RefCell<Option<Weak<Context>>>>;

pub struct Context {
    log: CallLog,
    this: Weak<Context>,
    thread: CurrentContext,
    pub lost: Cell<bool>,
    next_texture: Cell<u32>,
    pub bound: Cell<Option<TextureId>>,
}

impl Context {
    /// Creates a context on its own thread, current there.
    pub fn new(log: &CallLog) -> Rc<Self> {
        let context = Self::on_thread(log, Default::default());
        context.set_current(true);
        context
    }

    /// Creates another context on the thread of `self`, not current.
    pub fn new_sibling(&self) -> Rc<Self> {
        Self::on_thread(&self.log, self.thread.clone())
    }

    fn on_thread(log: &CallLog, thread: CurrentContext) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            log: log.clone(),
            this: this.clone(),
            thread,
            lost: Cell::new(false),
            next_texture: Cell::new(100),
            bound: Cell::new(None),
        })
    }

    /// Makes this context current, even if lost, or leaves the thread without a context if
    /// this one was current.
    pub fn set_current(&self, current: bool) {
        if current {
            *self.thread.borrow_mut() = Some(self.this.clone());
        } else if self.is_current() {
            self.release_current();
        }
    }
}

impl GlContext for Context {
    fn is_current(&self) -> bool {
        self.thread
            .borrow()
            .as_ref()
            .is_some_and(|current| Weak::ptr_eq(current, &self.this))
    }

    fn make_current(&self) -> bool {
        if self.lost.get() {
            return false;
        }
        self.set_current(true);
        true
    }

    fn current_on_thread(&self) -> Option<Rc<dyn GlContext>> {
        self.thread
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|c| c as Rc<dyn GlContext>)
    }

    fn release_current(&self) {
        *self.thread.borrow_mut() = None;
    }

    fn gen_texture(&self, _target: TextureTarget) -> Option<TextureId> {
        if self.lost.get() {
            return None;
        }
        let id = self.next_texture.get();
        self.next_texture.set(id + 1);
        Some(TextureId(id))
    }

    fn delete_texture(&self, texture: TextureId) {
        self.log.push(Call::DeleteTexture(texture.0));
    }

    fn bound_texture(&self, _target: TextureTarget) -> Option<TextureId> {
        self.bound.get()
    }
}

pub struct Host {
    pub alive: Cell<bool>,
    pub context: RefCell<Option<Rc<Context>>>,
}

impl Host {
    pub fn new(context: &Rc<Context>) -> Rc<Self> {
        Rc::new(Self {
            alive: Cell::new(true),
            context: RefCell::new(Some(context.clone())),
        })
    }
}

impl GlHost for Host {
    fn is_alive(&self) -> bool {
        self.alive.get()
    }

    fn current_context(&self) -> Option<Rc<dyn GlContext>> {
        self.context
            .borrow()
            .as_ref()
            .filter(|c| c.is_current())
            .map(|c| c.clone() as Rc<dyn GlContext>)
    }
}

pub struct Texture {
    service_id: TextureId,
    target: TextureTarget,
    pub size: Cell<Resolution>,
    pub image: RefCell<Option<Rc<dyn GlImage>>>,
    pub state: Cell<Option<ImageState>>,
    pub stream_texture: Cell<Option<TextureId>>,
    pub uploads: RefCell<Vec<(Resolution, Vec<u8>)>>,
}

impl Texture {
    pub fn new(service_id: u32, target: TextureTarget) -> Rc<Self> {
        Rc::new(Self {
            service_id: TextureId(service_id),
            target,
            size: Cell::new(Default::default()),
            image: RefCell::new(None),
            state: Cell::new(None),
            stream_texture: Cell::new(None),
            uploads: RefCell::new(Vec::new()),
        })
    }
}

impl TextureRef for Texture {
    fn service_id(&self) -> TextureId {
        self.service_id
    }

    fn target(&self) -> TextureTarget {
        self.target
    }

    fn set_level_info(&self, size: Resolution) {
        self.size.set(size);
    }

    fn set_level_image(
        &self,
        image: Option<Rc<dyn GlImage>>,
        state: ImageState,
        stream_texture: Option<TextureId>,
    ) {
        // Release the previous image outside of the borrow, its drop may call back into us.
        let previous = std::mem::replace(&mut *self.image.borrow_mut(), image);
        self.state.set(self.image.borrow().as_ref().map(|_| state));
        self.stream_texture.set(stream_texture);
        drop(previous);
    }

    fn set_level_image_state(&self, state: ImageState) {
        self.state.set(Some(state));
    }

    fn upload_rgba(&self, size: Resolution, pixels: &[u8]) {
        self.uploads.borrow_mut().push((size, pixels.to_vec()));
    }
}

pub struct Surfaces {
    log: CallLog,
    pub available: RefCell<BTreeSet<SurfaceId>>,
    pub created: RefCell<Vec<(TextureId, Rc<Surface>)>>,
}

impl Surfaces {
    pub fn new(log: &CallLog) -> Rc<Self> {
        Rc::new(Self {
            log: log.clone(),
            available: RefCell::new(BTreeSet::new()),
            created: RefCell::new(Vec::new()),
        })
    }

    pub fn last_created(&self) -> Option<Rc<Surface>> {
        self.created.borrow().last().map(|(_, s)| s.clone())
    }
}

impl SurfaceProvider for Surfaces {
    fn acquire_surface(&self, id: SurfaceId) -> BackendResult<()> {
        if self.available.borrow().contains(&id) {
            Ok(())
        } else {
            Err(BackendError::SurfaceUnavailable(id))
        }
    }

    fn create_consumer_surface(
        &self,
        texture: TextureId,
    ) -> BackendResult<Rc<dyn ConsumerSurface>> {
        let surface = Surface::new(&self.log);
        self.created.borrow_mut().push((texture, surface.clone()));
        Ok(surface)
    }
}
