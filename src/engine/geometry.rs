// src/engine/geometry.rs
//
// Crop geometry: automatic ratio/anchor crops, manual normalized rectangles,
// and negotiation with the (optional) interactive selection capability.

use crate::ops::{Anchor, AspectRatio, CropSettings, NormalizedRect};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Axis-aligned crop rectangle in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Whether manual rectangles may be honored in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CropAvailability {
    #[default]
    Manual,
    /// The selection capability is missing; manual mode degrades to a center crop.
    AutomaticOnly,
}

/// External interactive crop-selection tool.
pub trait SelectionProvider {
    /// Whether the tool loaded and can be asked for a selection.
    fn is_available(&self) -> bool {
        true
    }

    /// The user's current selection, if any.
    fn request_selection(&self) -> Option<NormalizedRect>;
}

/// Result of asking the selection capability what it can do.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NegotiatedSelection {
    pub availability: CropAvailability,
    /// Only ever a rectangle that satisfies the normalized invariants.
    pub rect: Option<NormalizedRect>,
}

pub fn negotiate_selection(provider: Option<&dyn SelectionProvider>) -> NegotiatedSelection {
    let Some(provider) = provider.filter(|p| p.is_available()) else {
        return NegotiatedSelection {
            availability: CropAvailability::AutomaticOnly,
            rect: None,
        };
    };
    let rect = match provider.request_selection() {
        Some(rect) if rect.is_valid() => Some(rect),
        Some(rect) => {
            warn!(?rect, "selection capability returned an invalid rectangle, ignoring it");
            None
        }
        None => None,
    };
    NegotiatedSelection {
        availability: CropAvailability::Manual,
        rect,
    }
}

/// Compute the crop rectangle for an image, or `None` when no crop applies.
///
/// Never fails: a degenerate manual rectangle falls back to no crop, and an
/// unavailable selection capability falls back to a centered automatic crop.
pub fn resolve(
    image_width: u32,
    image_height: u32,
    crop: &CropSettings,
    availability: CropAvailability,
) -> Option<PixelRect> {
    if image_width == 0 || image_height == 0 {
        return None;
    }
    if crop.anchor == Anchor::Manual {
        return match (availability, crop.manual_rect) {
            (CropAvailability::Manual, Some(rect)) => {
                resolve_manual(image_width, image_height, &rect)
            }
            _ => {
                warn!(
                    ?availability,
                    has_rect = crop.manual_rect.is_some(),
                    "manual crop unavailable, using automatic center crop"
                );
                resolve_automatic(image_width, image_height, crop.ratio, Anchor::Center)
            }
        };
    }
    resolve_automatic(image_width, image_height, crop.ratio, crop.anchor)
}

/// Scale a normalized rectangle to pixels and clamp it into the image.
pub fn resolve_manual(
    image_width: u32,
    image_height: u32,
    rect: &NormalizedRect,
) -> Option<PixelRect> {
    if !rect.is_valid() {
        warn!(?rect, "manual crop rectangle is invalid, skipping crop");
        return None;
    }
    if image_width == 0 || image_height == 0 {
        return None;
    }
    let w = image_width as f64;
    let h = image_height as f64;
    let x = ((rect.x * w).round() as u32).min(image_width - 1);
    let y = ((rect.y * h).round() as u32).min(image_height - 1);
    let width = ((rect.width * w).round() as u32).min(image_width - x);
    let height = ((rect.height * h).round() as u32).min(image_height - y);
    if width == 0 || height == 0 {
        warn!(
            ?rect,
            image_width, image_height, "manual crop degenerates after clamping, skipping crop"
        );
        return None;
    }
    Some(PixelRect {
        x,
        y,
        width,
        height,
    })
}

/// Largest rectangle of the target ratio, placed by anchor. `None` for a free ratio.
pub fn resolve_automatic(
    image_width: u32,
    image_height: u32,
    ratio: AspectRatio,
    anchor: Anchor,
) -> Option<PixelRect> {
    let target = ratio.value()?;
    if image_width == 0 || image_height == 0 {
        return None;
    }
    let w = image_width as f64;
    let h = image_height as f64;

    if w / h > target {
        // source is wider: keep full height
        let width = ((h * target).round() as u32).clamp(1, image_width);
        let spare = image_width - width;
        let x = match anchor {
            Anchor::Left => 0,
            Anchor::Right => spare,
            _ => ((spare as f64 / 2.0).round() as u32).min(spare),
        };
        Some(PixelRect {
            x,
            y: 0,
            width,
            height: image_height,
        })
    } else {
        let height = ((w / target).round() as u32).clamp(1, image_height);
        let spare = image_height - height;
        let y = match anchor {
            Anchor::Top => 0,
            Anchor::Bottom => spare,
            _ => ((spare as f64 / 2.0).round() as u32).min(spare),
        };
        Some(PixelRect {
            x: 0,
            y,
            width: image_width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSelection(Option<NormalizedRect>);

    impl SelectionProvider for FixedSelection {
        fn request_selection(&self) -> Option<NormalizedRect> {
            self.0
        }
    }

    struct BrokenSelection;

    impl SelectionProvider for BrokenSelection {
        fn is_available(&self) -> bool {
            false
        }

        fn request_selection(&self) -> Option<NormalizedRect> {
            None
        }
    }

    #[test]
    fn test_square_center_on_landscape() {
        let crop = CropSettings::new(AspectRatio::SQUARE, Anchor::Center);
        let rect = resolve(1600, 900, &crop, CropAvailability::Manual).unwrap();
        assert_eq!(
            rect,
            PixelRect {
                x: 350,
                y: 0,
                width: 900,
                height: 900
            }
        );
    }

    #[test]
    fn test_anchor_left_right_top_bottom() {
        let left = resolve_automatic(1600, 900, AspectRatio::SQUARE, Anchor::Left).unwrap();
        assert_eq!(left.x, 0);
        let right = resolve_automatic(1600, 900, AspectRatio::SQUARE, Anchor::Right).unwrap();
        assert_eq!(right.x, 700);

        let top = resolve_automatic(900, 1600, AspectRatio::SQUARE, Anchor::Top).unwrap();
        assert_eq!((top.y, top.height), (0, 900));
        let bottom = resolve_automatic(900, 1600, AspectRatio::SQUARE, Anchor::Bottom).unwrap();
        assert_eq!(bottom.y, 700);
    }

    #[test]
    fn test_widescreen_on_portrait_crops_height() {
        let rect = resolve_automatic(1080, 1920, AspectRatio::WIDESCREEN, Anchor::Center).unwrap();
        assert_eq!(rect.width, 1080);
        assert_eq!(rect.height, 608);
        assert!(rect.fits_within(1080, 1920));
    }

    #[test]
    fn test_free_ratio_without_rect_is_no_crop() {
        let crop = CropSettings::new(AspectRatio::Free, Anchor::Center);
        assert_eq!(resolve(800, 600, &crop, CropAvailability::Manual), None);
    }

    #[test]
    fn test_manual_rect_scaled() {
        let crop = CropSettings::manual(NormalizedRect::new(0.25, 0.5, 0.5, 0.5).unwrap());
        let rect = resolve(800, 600, &crop, CropAvailability::Manual).unwrap();
        assert_eq!(
            rect,
            PixelRect {
                x: 200,
                y: 300,
                width: 400,
                height: 300
            }
        );
    }

    #[test]
    fn test_degenerate_manual_rect_is_no_crop() {
        // rounds to zero width on a tiny image
        let crop = CropSettings::manual(NormalizedRect::new(0.0, 0.0, 0.01, 1.0).unwrap());
        assert_eq!(resolve(10, 10, &crop, CropAvailability::Manual), None);

        let invalid = NormalizedRect {
            x: 0.9,
            y: 0.0,
            width: 0.5,
            height: 1.0,
        };
        assert_eq!(resolve_manual(100, 100, &invalid), None);
    }

    #[test]
    fn test_manual_degrades_to_center_when_unavailable() {
        let mut crop = CropSettings::manual(NormalizedRect::new(0.0, 0.0, 0.5, 0.5).unwrap());
        crop.ratio = AspectRatio::SQUARE;
        let rect = resolve(1600, 900, &crop, CropAvailability::AutomaticOnly).unwrap();
        assert_eq!(rect.x, 350);
    }

    #[test]
    fn test_negotiation() {
        let none = negotiate_selection(None);
        assert_eq!(none.availability, CropAvailability::AutomaticOnly);

        let broken = negotiate_selection(Some(&BrokenSelection));
        assert_eq!(broken.availability, CropAvailability::AutomaticOnly);

        let rect = NormalizedRect::new(0.1, 0.1, 0.5, 0.5).unwrap();
        let ok = negotiate_selection(Some(&FixedSelection(Some(rect))));
        assert_eq!(ok.availability, CropAvailability::Manual);
        assert_eq!(ok.rect, Some(rect));

        let bad = NormalizedRect {
            x: 0.8,
            y: 0.0,
            width: 0.5,
            height: 0.5,
        };
        let rejected = negotiate_selection(Some(&FixedSelection(Some(bad))));
        assert_eq!(rejected.rect, None);
    }
}
