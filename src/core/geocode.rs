// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Compact geocodes: a short text encoding of a coordinate pair that can be read
//! out or sent without a street address.

/// Turns a coordinate pair into a compact code.
pub trait CompactGeocoder: Send + Sync {
    fn encode(&self, latitude: f64, longitude: f64) -> String;
}

/// Deterministic fixed-point encoding: both coordinates rounded to six decimal
/// places (about 11 cm), joined by a comma.
///
/// This is not an Open Location Code. Swap in a real encoder through
/// [`CompactGeocoder`] where one is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPointGeocoder;

impl CompactGeocoder for FixedPointGeocoder {
    fn encode(&self, latitude: f64, longitude: f64) -> String {
        let lat = latitude.clamp(-90.0, 90.0);
        // Wrap longitude into [-180, 180).
        let lng = (longitude + 180.0).rem_euclid(360.0) - 180.0;
        format!("{:.6},{:.6}", lat, lng)
    }
}
