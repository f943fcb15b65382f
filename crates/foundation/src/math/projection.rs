/// Longitude span of the projected world (degrees).
pub const LON_SPAN_DEG: f64 = 360.0;
/// Latitude span of the projected world (degrees).
pub const LAT_SPAN_DEG: f64 = 180.0;

/// Geographic coordinate in degrees.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LonLat {
    pub lon_deg: f64,
    pub lat_deg: f64,
}

impl LonLat {
    pub fn new(lon_deg: f64, lat_deg: f64) -> Self {
        Self { lon_deg, lat_deg }
    }
}

/// Equirectangular (plate carrée) mapping between geographic coordinates and
/// a fixed-size raster.
///
/// The same instance is used for painting boundaries and for resolving a
/// clicked raster point back to a geographic coordinate, so forward and
/// inverse stay consistent by construction.
///
/// Raster convention: x grows east from the antimeridian, y grows south from
/// the north pole. `(0,0)` is the top-left pixel.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RasterProjection {
    pub width: u32,
    pub height: u32,
}

impl RasterProjection {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Projects a geographic coordinate to fractional raster coordinates.
    pub fn project(&self, geo: LonLat) -> (f64, f64) {
        let x = (geo.lon_deg + LON_SPAN_DEG / 2.0) / LON_SPAN_DEG * self.width as f64;
        let y = (LAT_SPAN_DEG / 2.0 - geo.lat_deg) / LAT_SPAN_DEG * self.height as f64;
        (x, y)
    }

    /// Inverse-projects a raster coordinate back to geographic degrees.
    pub fn unproject(&self, x: f64, y: f64) -> LonLat {
        let lon = x / self.width as f64 * LON_SPAN_DEG - LON_SPAN_DEG / 2.0;
        let lat = LAT_SPAN_DEG / 2.0 - y / self.height as f64 * LAT_SPAN_DEG;
        LonLat::new(lon, lat)
    }
}

#[cfg(test)]
mod tests {
    use super::{LonLat, RasterProjection};

    fn assert_close(a: f64, b: f64, eps: f64) {
        let diff = (a - b).abs();
        assert!(diff <= eps, "expected {a} ~= {b} (diff {diff})");
    }

    #[test]
    fn origin_maps_to_raster_center() {
        let p = RasterProjection::new(360, 180);
        let (x, y) = p.project(LonLat::new(0.0, 0.0));
        assert_close(x, 180.0, 1e-12);
        assert_close(y, 90.0, 1e-12);
    }

    #[test]
    fn north_west_corner_is_top_left() {
        let p = RasterProjection::new(1024, 512);
        let (x, y) = p.project(LonLat::new(-180.0, 90.0));
        assert_close(x, 0.0, 1e-12);
        assert_close(y, 0.0, 1e-12);
    }

    #[test]
    fn round_trip_project_unproject() {
        let p = RasterProjection::new(1400, 700);
        let geo = LonLat::new(127.5, 36.2);
        let (x, y) = p.project(geo);
        let rt = p.unproject(x, y);
        assert_close(rt.lon_deg, geo.lon_deg, 1e-9);
        assert_close(rt.lat_deg, geo.lat_deg, 1e-9);
    }

    #[test]
    fn unproject_raster_corners() {
        let p = RasterProjection::new(100, 50);
        let nw = p.unproject(0.0, 0.0);
        assert_close(nw.lon_deg, -180.0, 1e-12);
        assert_close(nw.lat_deg, 90.0, 1e-12);

        let se = p.unproject(100.0, 50.0);
        assert_close(se.lon_deg, 180.0, 1e-12);
        assert_close(se.lat_deg, -90.0, 1e-12);
    }
}
