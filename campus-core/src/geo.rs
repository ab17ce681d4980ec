//! Great-circle distance and nearby-search helpers.
//!
//! All distances are in meters on a spherical Earth. Antimeridian crossing
//! and polar coordinates get no special treatment: bounds and centroids are
//! plain min/max/mean over latitude and longitude, which is adequate for a
//! campus-sized search radius but wrong for sets that straddle ±180°.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Build coordinates from optional parts. Missing or non-finite parts
    /// yield `None`.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => {
                Some(Self::new(lat, lon))
            }
            _ => None,
        }
    }

    /// Haversine distance to `other` in meters.
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let phi1 = self.latitude.to_radians();
        let phi2 = other.latitude.to_radians();
        let d_phi = (other.latitude - self.latitude).to_radians();
        let d_lambda = (other.longitude - self.longitude).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

/// Anything that may carry a position.
pub trait Located {
    fn coordinates(&self) -> Option<Coordinates>;
}

impl Located for Coordinates {
    fn coordinates(&self) -> Option<Coordinates> {
        Some(*self)
    }
}

impl<T: Located> Located for &T {
    fn coordinates(&self) -> Option<Coordinates> {
        (*self).coordinates()
    }
}

/// An item decorated with its distance from a search origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithDistance<T> {
    #[serde(flatten)]
    pub item: T,
    /// Meters from the origin, `None` when the item has no position.
    pub distance: Option<f64>,
}

/// Distance in meters between two points given as optional parts.
///
/// Returns `None` if any coordinate is missing.
pub fn distance(
    lat1: Option<f64>,
    lon1: Option<f64>,
    lat2: Option<f64>,
    lon2: Option<f64>,
) -> Option<f64> {
    let from = Coordinates::from_parts(lat1, lon1)?;
    let to = Coordinates::from_parts(lat2, lon2)?;
    Some(from.distance_to(&to))
}

/// Render a distance as `"{n} m"` below one kilometer, else `"{n.n} km"`.
pub fn format_distance(meters: f64) -> String {
    // compare after rounding: 999.6 is "1.0 km"
    let rounded = meters.round();
    if rounded < 1000.0 {
        format!("{} m", rounded as i64)
    } else {
        format!("{:.1} km", meters / 1000.0)
    }
}

fn decorate<T: Located>(item: T, origin: &Coordinates) -> WithDistance<T> {
    let distance = item.coordinates().map(|c| origin.distance_to(&c));
    WithDistance { item, distance }
}

/// Decorate each item with its distance from `origin` and order ascending.
///
/// Items without a position sort last. The sort is stable, so ties and
/// unknown positions keep their input order.
pub fn sort_by_distance<T, I>(items: I, origin: Coordinates) -> Vec<WithDistance<T>>
where
    T: Located,
    I: IntoIterator<Item = T>,
{
    let mut decorated: Vec<WithDistance<T>> =
        items.into_iter().map(|item| decorate(item, &origin)).collect();
    decorated.sort_by(|a, b| match (a.distance, b.distance) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    decorated
}

/// Keep the items whose distance from `origin` is known and `<= radius_m`.
/// Input order is preserved.
pub fn filter_by_radius<T, I>(items: I, origin: Coordinates, radius_m: f64) -> Vec<WithDistance<T>>
where
    T: Located,
    I: IntoIterator<Item = T>,
{
    items
        .into_iter()
        .map(|item| decorate(item, &origin))
        .filter(|d| matches!(d.distance, Some(m) if m <= radius_m))
        .collect()
}

/// Latitude/longitude extent of a set of points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

/// Min/max extent over every located item; `None` when nothing is located.
pub fn bounds<T: Located>(items: &[T]) -> Option<Bounds> {
    let mut located = items.iter().filter_map(|item| item.coordinates());
    let first = located.next()?;
    let init = Bounds {
        min_latitude: first.latitude,
        max_latitude: first.latitude,
        min_longitude: first.longitude,
        max_longitude: first.longitude,
    };
    Some(located.fold(init, |b, c| Bounds {
        min_latitude: b.min_latitude.min(c.latitude),
        max_latitude: b.max_latitude.max(c.latitude),
        min_longitude: b.min_longitude.min(c.longitude),
        max_longitude: b.max_longitude.max(c.longitude),
    }))
}

/// Arithmetic mean of every located item; `None` when nothing is located.
pub fn centroid<T: Located>(items: &[T]) -> Option<Coordinates> {
    let (count, lat_sum, lon_sum) = items
        .iter()
        .filter_map(|item| item.coordinates())
        .fold((0usize, 0.0f64, 0.0f64), |(n, lat, lon), c| {
            (n + 1, lat + c.latitude, lon + c.longitude)
        });
    if count == 0 {
        return None;
    }
    Some(Coordinates::new(
        lat_sum / count as f64,
        lon_sum / count as f64,
    ))
}
