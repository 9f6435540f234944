//! WGS84 <-> UTM coordinate transforms and WKT formatting.
//!
//! The pipeline only ever sees geographic coordinates (EPSG:4326) and
//! UTM grids (EPSG 326xx/327xx), so the standard transverse Mercator
//! series is carried in-tree instead of binding a system projection
//! library.

use geo::{LineString, MultiPolygon, Polygon};

use crate::error::CrsError;
use crate::grid::Bounds;

const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

fn e2() -> f64 {
    F * (2.0 - F)
}

fn ep2() -> f64 {
    let e2 = e2();
    e2 / (1.0 - e2)
}

/// UTM zone and hemisphere of an EPSG code, if it names one.
pub fn zone_of(epsg: u32) -> Option<(u8, bool)> {
    match epsg {
        32601..=32660 => Some(((epsg - 32600) as u8, true)),
        32701..=32760 => Some(((epsg - 32700) as u8, false)),
        _ => None,
    }
}

pub fn is_supported(epsg: u32) -> bool {
    epsg == 4326 || zone_of(epsg).is_some()
}

fn central_meridian(zone: u8) -> f64 {
    f64::from(zone) * 6.0 - 183.0
}

fn meridional_arc(phi: f64) -> f64 {
    let e2 = e2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    A * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
        - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn utm_forward(lon: f64, lat: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = e2();
    let ep2 = ep2();
    let phi = lat.to_radians();
    let lam = lon.to_radians();
    let lam0 = central_meridian(zone).to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let n = A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = (phi.tan()) * (phi.tan());
    let c = ep2 * cos_phi * cos_phi;
    let a = (lam - lam0) * cos_phi;
    let m = meridional_arc(phi);

    let easting = K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + FALSE_EASTING;
    let mut northing = K0
        * (m + n
            * phi.tan()
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if !north {
        northing += FALSE_NORTHING_SOUTH;
    }
    (easting, northing)
}

fn utm_inverse(x: f64, y: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = e2();
    let ep2 = ep2();
    let x = x - FALSE_EASTING;
    let y = if north { y } else { y - FALSE_NORTHING_SOUTH };

    let m = y / K0;
    let mu = m / (A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let t1 = tan_phi1 * tan_phi1;
    let n1 = A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let r1 = A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * K0);

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lam = central_meridian(zone).to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos_phi1;

    (lam.to_degrees(), phi.to_degrees())
}

/// Geographic (lon, lat) to projected (x, y).
pub fn project(epsg: u32, lon: f64, lat: f64) -> Result<(f64, f64), CrsError> {
    if epsg == 4326 {
        return Ok((lon, lat));
    }
    match zone_of(epsg) {
        Some((zone, north)) => Ok(utm_forward(lon, lat, zone, north)),
        None => Err(CrsError::UnsupportedEpsg(epsg)),
    }
}

/// Projected (x, y) to geographic (lon, lat).
pub fn unproject(epsg: u32, x: f64, y: f64) -> Result<(f64, f64), CrsError> {
    if epsg == 4326 {
        return Ok((x, y));
    }
    match zone_of(epsg) {
        Some((zone, north)) => Ok(utm_inverse(x, y, zone, north)),
        None => Err(CrsError::UnsupportedEpsg(epsg)),
    }
}

/// Project every vertex of a geographic multipolygon into `epsg`.
pub fn project_multi_polygon(
    epsg: u32,
    geometry: &MultiPolygon<f64>,
) -> Result<MultiPolygon<f64>, CrsError> {
    let mut polys = Vec::with_capacity(geometry.0.len());
    for poly in &geometry.0 {
        polys.push(project_polygon(epsg, poly)?);
    }
    Ok(MultiPolygon::new(polys))
}

fn project_polygon(epsg: u32, poly: &Polygon<f64>) -> Result<Polygon<f64>, CrsError> {
    let project_ring = |ring: &LineString<f64>| -> Result<LineString<f64>, CrsError> {
        let mut coords = Vec::with_capacity(ring.0.len());
        for c in &ring.0 {
            let (x, y) = project(epsg, c.x, c.y)?;
            coords.push((x, y));
        }
        Ok(LineString::from(coords))
    };
    let exterior = project_ring(poly.exterior())?;
    let mut interiors = Vec::new();
    for ring in poly.interiors() {
        interiors.push(project_ring(ring)?);
    }
    Ok(Polygon::new(exterior, interiors))
}

/// Geographic footprint polygon of a projected bbox, corner by corner.
pub fn bounds_to_wgs84(epsg: u32, bounds: &Bounds) -> Result<Polygon<f64>, CrsError> {
    let mut coords = Vec::with_capacity(5);
    for (x, y) in bounds.corners() {
        let (lon, lat) = unproject(epsg, x, y)?;
        coords.push((lon, lat));
    }
    coords.push(coords[0]);
    Ok(Polygon::new(LineString::from(coords), vec![]))
}

/// Format a polygon's exterior ring as WKT.
pub fn wkt_polygon(poly: &Polygon<f64>) -> String {
    let ring = poly
        .exterior()
        .0
        .iter()
        .map(|c| format!("{:.6} {:.6}", c.x, c.y))
        .collect::<Vec<_>>()
        .join(", ");
    format!("POLYGON (({ring}))")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_meridian_maps_to_false_easting() {
        let (x, y) = project(32633, 15.0, 0.0).expect("supported");
        assert!((x - 500_000.0).abs() < 1e-6, "easting {x}");
        assert!(y.abs() < 1e-6, "northing {y}");
    }

    #[test]
    fn round_trip_mid_latitude() {
        let (x, y) = project(32633, 14.31, 48.22).expect("supported");
        let (lon, lat) = unproject(32633, x, y).expect("supported");
        assert!((lon - 14.31).abs() < 1e-8, "lon {lon}");
        assert!((lat - 48.22).abs() < 1e-8, "lat {lat}");
    }

    #[test]
    fn southern_hemisphere_uses_false_northing() {
        let (x, y) = project(32733, 15.0, -33.0).expect("supported");
        assert!((x - 500_000.0).abs() < 1e-6, "easting {x}");
        assert!(y > 6_000_000.0 && y < 6_700_000.0, "northing {y}");
        let (lon, lat) = unproject(32733, x, y).expect("supported");
        assert!((lon - 15.0).abs() < 1e-8);
        assert!((lat + 33.0).abs() < 1e-8);
    }

    #[test]
    fn rejects_non_utm_codes() {
        assert!(project(3857, 0.0, 0.0).is_err());
        assert!(unproject(27700, 0.0, 0.0).is_err());
        assert!(is_supported(4326));
        assert!(is_supported(32719));
        assert!(!is_supported(2154));
    }

    #[test]
    fn geographic_passthrough() {
        assert_eq!(project(4326, 12.5, -7.25).expect("ok"), (12.5, -7.25));
    }

    #[test]
    fn bounds_footprint_round_trips() {
        let bounds = Bounds::new(499_000.0, 4_499_000.0, 501_000.0, 4_501_000.0);
        let poly = bounds_to_wgs84(32633, &bounds).expect("supported");
        assert_eq!(poly.exterior().0.len(), 5);
        // Projecting the corners back lands on the original bbox.
        for (c, (x, y)) in poly.exterior().0.iter().zip(bounds.corners()) {
            let (px, py) = project(32633, c.x, c.y).expect("supported");
            assert!((px - x).abs() < 1e-3, "x {px} vs {x}");
            assert!((py - y).abs() < 1e-3, "y {py} vs {y}");
        }
    }

    #[test]
    fn wkt_has_exterior_ring_only() {
        let poly = Bounds::new(0.0, 0.0, 1.0, 1.0).to_polygon();
        let wkt = wkt_polygon(&poly);
        assert!(wkt.starts_with("POLYGON ((0.000000 0.000000, "), "{wkt}");
        assert!(wkt.ends_with("0.000000 0.000000))"), "{wkt}");
    }
}
