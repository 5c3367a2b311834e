use crate::models::Coordinate;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates using the haversine formula.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1] for antipodal points.
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    EARTH_RADIUS_KM * c
}

pub fn distance_m(a: Coordinate, b: Coordinate) -> f64 {
    distance_km(a, b) * 1000.0
}

pub fn format_distance(km: f64) -> String {
    if km < 1.0 {
        format!("{} m", (km * 1000.0).round() as i64)
    } else {
        format!("{:.1} km", km)
    }
}

#[cfg(test)]
mod tests {
    use super::{distance_km, format_distance};
    use crate::models::Coordinate;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_coordinate()(
            latitude in -90.0f64..=90.0,
            longitude in -180.0f64..=180.0,
        ) -> Coordinate {
            Coordinate::new(latitude, longitude)
        }
    }

    proptest! {
        #[test]
        fn distance_is_symmetric(a in arb_coordinate(), b in arb_coordinate()) {
            let forward = distance_km(a, b);
            let backward = distance_km(b, a);
            prop_assert!((forward - backward).abs() < 1e-9);
        }

        #[test]
        fn distance_to_self_is_zero(a in arb_coordinate()) {
            prop_assert_eq!(distance_km(a, a), 0.0);
        }

        #[test]
        fn distance_never_exceeds_half_circumference(a in arb_coordinate(), b in arb_coordinate()) {
            let distance = distance_km(a, b);
            prop_assert!(distance >= 0.0);
            prop_assert!(distance <= std::f64::consts::PI * super::EARTH_RADIUS_KM + 1e-6);
        }
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let distance = distance_km(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
        assert!((distance - 111.19).abs() < 0.01, "got {distance}");
    }

    #[test]
    fn known_city_pair() {
        // Lagos to Abuja, roughly 530 km.
        let lagos = Coordinate::new(6.5244, 3.3792);
        let abuja = Coordinate::new(9.0765, 7.3986);
        let distance = distance_km(lagos, abuja);
        assert!((520.0..540.0).contains(&distance), "got {distance}");
    }

    #[test]
    fn formats_meters_below_one_km() {
        assert_eq!(format_distance(0.0), "0 m");
        assert_eq!(format_distance(0.4567), "457 m");
        assert_eq!(format_distance(0.9994), "999 m");
    }

    #[test]
    fn formats_kilometers_with_one_decimal() {
        assert_eq!(format_distance(1.0), "1.0 km");
        assert_eq!(format_distance(2.46), "2.5 km");
        assert_eq!(format_distance(12.04), "12.0 km");
    }
}
