//! Delivery host selection.
//!
//! The host is the discrete 1-median of the members with a known location:
//! the member whose summed great-circle distance to every other located
//! member is smallest. Groups are small, so the O(n²) scan is fine.

use crate::model::{Coordinates, Location, UserId};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Pick the host among `members`, given in join order.
///
/// - no member located: the first member (the creator)
/// - one member located: that member
/// - otherwise: minimal total distance, ties going to the earliest joiner
///
/// Returns `None` only for an empty slice.
pub fn select_host(members: &[(UserId, Location)]) -> Option<UserId> {
    let located: Vec<(UserId, Coordinates)> = members
        .iter()
        .filter_map(|(user, location)| location.coordinates().map(|c| (*user, c)))
        .collect();

    match located.as_slice() {
        [] => members.first().map(|(user, _)| *user),
        [(only, _)] => Some(*only),
        _ => {
            let mut best: Option<(UserId, f64)> = None;
            for (i, (candidate, at)) in located.iter().enumerate() {
                let total: f64 = located
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, (_, peer))| haversine_km(*at, *peer))
                    .sum();
                // strict comparison keeps the earliest joiner on ties
                if best.is_none_or(|(_, best_total)| total < best_total) {
                    best = Some((*candidate, total));
                }
            }
            best.map(|(user, _)| user)
        }
    }
}
