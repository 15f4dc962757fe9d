// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::Resolution;
use crate::TextureTarget;
use crate::TransformMatrix;

/// An image the GL layer can attach to a texture level and sample from.
///
/// The texture manager holds images through this trait and calls back into them when the
/// texture they decorate is used for drawing.
pub trait GlImage {
    fn size(&self) -> Resolution;

    /// Binds the image as the contents of the texture bound to `target`. Returns false if the
    /// image can only be used through [`GlImage::copy_tex_image`].
    fn bind_tex_image(&self, target: TextureTarget) -> bool;

    /// Called each time the texture bound to `target` is about to be sampled. Returns false if
    /// the image cannot provide its contents this way.
    fn copy_tex_image(&self, target: TextureTarget) -> bool;

    /// Returns the transform to apply to texture coordinates when sampling the image.
    fn texture_matrix(&self) -> TransformMatrix;

    /// Displays the image as an overlay plane. Returns false if the image cannot be overlaid.
    fn schedule_overlay_plane(&self) -> bool;

    /// Releases the resources held by the image. `have_context` tells whether a GL context is
    /// current.
    fn destroy(&self, have_context: bool);
}
