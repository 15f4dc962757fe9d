// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use avda_backing::backend::BackendResult;
use avda_backing::backend::ConsumerSurface;
use avda_backing::backend::FrameAvailableCallback;
use avda_backing::backend::GlContext;
use avda_backing::backend::GlHost;
use avda_backing::backend::SurfaceProvider;
use avda_backing::backend::TextureRef;
use avda_backing::backend::VideoCodecBridge;
use avda_backing::backing::deferred::DeferredBackingStrategy;
use avda_backing::backing::BackingOptions;
use avda_backing::backing::BackingStrategy;
use avda_backing::backing::PictureBuffer;
use avda_backing::backing::SurfaceKind;
use avda_backing::image::GlImage;
use avda_backing::CodecBufferIndex;
use avda_backing::ImageState;
use avda_backing::PictureBufferId;
use avda_backing::Resolution;
use avda_backing::SurfaceId;
use avda_backing::TextureId;
use avda_backing::TextureTarget;
use avda_backing::TransformMatrix;
use libfuzzer_sys::fuzz_target;

const PICTURES: i32 = 8;

#[derive(Default)]
struct Surface {
    callback: RefCell<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ConsumerSurface for Surface {
    fn update_tex_image(&self) -> BackendResult<()> {
        Ok(())
    }

    fn transform_matrix(&self) -> TransformMatrix {
        [1.0; 16]
    }

    fn set_frame_available_callback(&self, callback: FrameAvailableCallback) {
        *self.callback.borrow_mut() = Some(Arc::from(callback));
    }
}

struct Codec {
    surface: Rc<Surface>,
}

impl VideoCodecBridge for Codec {
    fn release_output_buffer(&self, _index: CodecBufferIndex, render: bool) -> BackendResult<()> {
        if render {
            if let Some(callback) = self.surface.callback.borrow().clone() {
                callback();
            }
        }
        Ok(())
    }
}

struct Context;

impl GlContext for Context {
    fn is_current(&self) -> bool {
        true
    }

    fn make_current(&self) -> bool {
        true
    }

    fn current_on_thread(&self) -> Option<Rc<dyn GlContext>> {
        None
    }

    fn release_current(&self) {}

    fn gen_texture(&self, _target: TextureTarget) -> Option<TextureId> {
        Some(TextureId(1))
    }

    fn delete_texture(&self, _texture: TextureId) {}

    fn bound_texture(&self, _target: TextureTarget) -> Option<TextureId> {
        Some(TextureId(1))
    }
}

struct Host;

impl GlHost for Host {
    fn is_alive(&self) -> bool {
        true
    }

    fn current_context(&self) -> Option<Rc<dyn GlContext>> {
        Some(Rc::new(Context))
    }
}

struct Surfaces {
    surface: Rc<Surface>,
}

impl SurfaceProvider for Surfaces {
    fn acquire_surface(&self, _id: SurfaceId) -> BackendResult<()> {
        Ok(())
    }

    fn create_consumer_surface(
        &self,
        _texture: TextureId,
    ) -> BackendResult<Rc<dyn ConsumerSurface>> {
        Ok(self.surface.clone())
    }
}

struct Texture {
    id: TextureId,
    target: TextureTarget,
    image: RefCell<Option<Rc<dyn GlImage>>>,
    state: Cell<ImageState>,
}

impl TextureRef for Texture {
    fn service_id(&self) -> TextureId {
        self.id
    }

    fn target(&self) -> TextureTarget {
        self.target
    }

    fn set_level_info(&self, _size: Resolution) {}

    fn set_level_image(
        &self,
        image: Option<Rc<dyn GlImage>>,
        state: ImageState,
        _stream_texture: Option<TextureId>,
    ) {
        let previous = std::mem::replace(&mut *self.image.borrow_mut(), image);
        self.state.set(state);
        drop(previous);
    }

    fn set_level_image_state(&self, state: ImageState) {
        self.state.set(state);
    }

    fn upload_rgba(&self, _size: Resolution, _pixels: &[u8]) {}
}

fuzz_target!(|data: &[u8]| {
    let Some((&mode, ops)) = data.split_first() else {
        return;
    };

    let surface = Rc::new(Surface::default());
    let codec: Rc<dyn VideoCodecBridge> = Rc::new(Codec {
        surface: surface.clone(),
    });
    let mut strategy = DeferredBackingStrategy::new(
        Rc::new(Host),
        Rc::new(Surfaces { surface }),
        BackingOptions {
            frame_wait_timeout: Duration::from_millis(1),
        },
    );

    let kind = if mode & 1 == 0 {
        SurfaceKind::Direct(SurfaceId(1))
    } else {
        SurfaceKind::Consumer
    };
    if strategy.initialize(kind).is_err() {
        return;
    }
    strategy.codec_changed(Some(codec.clone()));

    let target = strategy.texture_target();
    let buffers: Vec<PictureBuffer> = (0..PICTURES)
        .map(|id| PictureBuffer {
            id: PictureBufferId(id),
            size: Resolution::from((16, 16)),
            texture: Rc::new(Texture {
                id: TextureId(10 + id as u32),
                target,
                image: RefCell::new(None),
                state: Cell::new(ImageState::Unbound),
            }),
        })
        .collect();
    for buffer in &buffers {
        strategy.attach_picture_buffer(buffer, true);
    }

    let mut next_index = 0;
    for &op in ops {
        let id = PictureBufferId((op >> 3) as i32 % PICTURES);
        match op & 7 {
            0..=2 => {
                let _ = strategy.assign_picture_buffer(id, CodecBufferIndex(next_index));
                next_index += 1;
            }
            3 | 4 => strategy.reclaim_picture_buffer(id),
            5 => {
                if let Some(image) = strategy
                    .shared_state()
                    .and_then(|state| state.image_for_picture(id))
                {
                    image.copy_tex_image(TextureTarget::External);
                    image.texture_matrix();
                }
            }
            6 => strategy.release_codec_buffers(&buffers),
            _ => strategy.codec_changed(Some(codec.clone())),
        }

        let out = strategy.pictures_out_for_display();
        for (i, id) in out.iter().enumerate() {
            assert!(!out[i + 1..].contains(id));
        }

        let state = strategy.shared_state().unwrap();
        let fronts = out
            .iter()
            .filter_map(|id| state.image_for_picture(*id))
            .filter(|image| image.was_promoted_to_front())
            .count();
        assert!(fronts <= 1);
    }

    strategy.cleanup(true, &buffers);
});
