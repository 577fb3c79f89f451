//! Geographic primitives shared by the sampling and rendering paths.
//!
//! Coordinates are plain degrees (WGS84 latitude/longitude) stored as `f64`.
//! Interpolation is planar in degree space: segments between two samples are
//! a few hundred metres at most, so great-circle correction is below the
//! display resolution of a map marker.

use serde::{Deserialize, Serialize};

/// Anchor used for simulated broadcasters and for the empty-map viewport.
pub const DEFAULT_COORDINATES: LatLng = LatLng {
    lat: 17.43065300129256,
    lng: 78.53042705991402,
};

/// Spread (degrees) applied around the anchor when a simulated session starts.
/// Roughly 1 km at the equator.
pub const COORDINATE_VARIATION: f64 = 0.02;

/// Maximum per-axis movement (degrees) of one simulation tick.
pub const SIMULATION_STEP: f64 = 0.001;

/// Zoom level of the default viewport.
pub const DEFAULT_ZOOM: u8 = 13;

/// Padding (pixels) kept around fitted bounds.
pub const FIT_PADDING_PX: u32 = 50;

// ───────────────────────────────────────────────────────────────────
// LatLng
// ───────────────────────────────────────────────────────────────────

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// Raw position sample produced by a location source.
pub type LocationSample = LatLng;

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite, latitude in [-90, 90], longitude in [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &LatLng, t: f64) -> LatLng {
        LatLng {
            lat: self.lat + (target.lat - self.lat) * t,
            lng: self.lng + (target.lng - self.lng) * t,
        }
    }

    /// Planar distance in degree space.
    pub fn planar_distance(&self, other: &LatLng) -> f64 {
        let dlat = self.lat - other.lat;
        let dlng = self.lng - other.lng;
        (dlat * dlat + dlng * dlng).sqrt()
    }

    /// True when both axes differ by less than `epsilon`.
    pub fn approx_eq(&self, other: &LatLng, epsilon: f64) -> bool {
        (self.lat - other.lat).abs() < epsilon && (self.lng - other.lng).abs() < epsilon
    }

    /// Offset by the given deltas (degrees).
    pub fn offset(&self, dlat: f64, dlng: f64) -> LatLng {
        LatLng {
            lat: self.lat + dlat,
            lng: self.lng + dlng,
        }
    }
}

impl Default for LatLng {
    fn default() -> Self {
        DEFAULT_COORDINATES
    }
}

// ───────────────────────────────────────────────────────────────────
// Bounds & viewport
// ───────────────────────────────────────────────────────────────────

/// Axis-aligned bounding box of a set of positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl Bounds {
    /// Bounding box of all valid points; `None` if there are none.
    pub fn from_points<'a, I>(points: I) -> Option<Bounds>
    where
        I: IntoIterator<Item = &'a LatLng>,
    {
        let mut bounds: Option<Bounds> = None;
        for p in points.into_iter().filter(|p| p.is_valid()) {
            bounds = Some(match bounds {
                None => Bounds {
                    south_west: *p,
                    north_east: *p,
                },
                Some(b) => b.extend(p),
            });
        }
        bounds
    }

    fn extend(self, p: &LatLng) -> Bounds {
        Bounds {
            south_west: LatLng::new(self.south_west.lat.min(p.lat), self.south_west.lng.min(p.lng)),
            north_east: LatLng::new(self.north_east.lat.max(p.lat), self.north_east.lng.max(p.lng)),
        }
    }

    pub fn center(&self) -> LatLng {
        self.south_west.lerp(&self.north_east, 0.5)
    }

    pub fn contains(&self, p: &LatLng) -> bool {
        (self.south_west.lat..=self.north_east.lat).contains(&p.lat)
            && (self.south_west.lng..=self.north_east.lng).contains(&p.lng)
    }
}

/// What the map view should show.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Viewport {
    /// Centered view at a fixed zoom level.
    Center { center: LatLng, zoom: u8 },
    /// Fit the bounds, keeping `padding_px` pixels free on every side.
    Fit { bounds: Bounds, padding_px: u32 },
}

impl Viewport {
    /// View used while nobody is broadcasting.
    pub fn default_view() -> Self {
        Viewport::Center {
            center: DEFAULT_COORDINATES,
            zoom: DEFAULT_ZOOM,
        }
    }
}

/// Viewport for a set of broadcaster positions.
///
/// `total` is the number of active broadcasters including those whose
/// position is not renderable. Returns `None` when broadcasters exist but
/// none has a valid position: the current view is kept.
pub fn fit_viewport(positions: &[LatLng], total: usize) -> Option<Viewport> {
    if total == 0 {
        return Some(Viewport::default_view());
    }
    Bounds::from_points(positions).map(|bounds| Viewport::Fit {
        bounds,
        padding_px: FIT_PADDING_PX,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latlng_validity() {
        assert!(LatLng::new(0.0, 0.0).is_valid());
        assert!(LatLng::new(-90.0, 180.0).is_valid());
        assert!(LatLng::new(90.0, -180.0).is_valid());
        assert!(!LatLng::new(90.5, 0.0).is_valid());
        assert!(!LatLng::new(0.0, -180.1).is_valid());
        assert!(!LatLng::new(f64::NAN, 0.0).is_valid());
        assert!(!LatLng::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_latlng_lerp() {
        let a = LatLng::new(10.0, 20.0);
        let b = LatLng::new(20.0, 40.0);

        let mid = a.lerp(&b, 0.5);
        assert!((mid.lat - 15.0).abs() < 1e-12);
        assert!((mid.lng - 30.0).abs() < 1e-12);

        assert_eq!(a.lerp(&b, 0.0), a);
        let end = a.lerp(&b, 1.0);
        assert!((end.lat - 20.0).abs() < 1e-12);
        assert!((end.lng - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_latlng_distance_and_approx_eq() {
        let a = LatLng::new(0.0, 0.0);
        let b = LatLng::new(3.0, 4.0);
        assert!((a.planar_distance(&b) - 5.0).abs() < 1e-12);

        let c = LatLng::new(1e-9, -1e-9);
        assert!(a.approx_eq(&c, 1e-8));
        assert!(!a.approx_eq(&b, 1e-8));
    }

    #[test]
    fn test_bounds_skip_invalid_points() {
        let points = [
            LatLng::new(10.0, 10.0),
            LatLng::new(f64::NAN, 5.0),
            LatLng::new(12.0, 8.0),
            LatLng::new(200.0, 0.0),
        ];
        let bounds = Bounds::from_points(&points).unwrap();
        assert_eq!(bounds.south_west, LatLng::new(10.0, 8.0));
        assert_eq!(bounds.north_east, LatLng::new(12.0, 10.0));
        assert_eq!(bounds.center(), LatLng::new(11.0, 9.0));
        assert!(bounds.contains(&LatLng::new(11.0, 9.5)));
        assert!(!bounds.contains(&LatLng::new(13.0, 9.5)));
    }

    #[test]
    fn test_bounds_empty() {
        assert!(Bounds::from_points(&[]).is_none());
        assert!(Bounds::from_points(&[LatLng::new(f64::NAN, 0.0)]).is_none());
    }

    #[test]
    fn test_fit_viewport_empty_uses_default() {
        match fit_viewport(&[], 0) {
            Some(Viewport::Center { center, zoom }) => {
                assert_eq!(center, DEFAULT_COORDINATES);
                assert_eq!(zoom, DEFAULT_ZOOM);
            }
            other => panic!("Expected default view, got {other:?}"),
        }
    }

    #[test]
    fn test_fit_viewport_keeps_view_without_renderable_positions() {
        assert!(fit_viewport(&[], 2).is_none());
    }

    #[test]
    fn test_fit_viewport_bounds() {
        let positions = [LatLng::new(1.0, 2.0), LatLng::new(3.0, 4.0)];
        match fit_viewport(&positions, 2) {
            Some(Viewport::Fit { bounds, padding_px }) => {
                assert_eq!(padding_px, FIT_PADDING_PX);
                assert_eq!(bounds.south_west, LatLng::new(1.0, 2.0));
                assert_eq!(bounds.north_east, LatLng::new(3.0, 4.0));
            }
            other => panic!("Expected fitted bounds, got {other:?}"),
        }
    }
}
