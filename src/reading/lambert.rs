//! Lambert conformal conic projection for GRIB2 grid template 3.30.

use std::f64::consts::PI;

/// Projection from grid indices to geographic coordinates.
///
/// Longitudes are returned in the convention of `lov` and `lon1`: GRIB2 files
/// use [0, 360).
#[derive(Debug, Clone, PartialEq)]
pub struct LambertConformal {
    lon0: f64,
    lon1: f64,
    dx: f64,
    dy: f64,
    earth_radius: f64,
    n: f64,
    f: f64,
    rho0: f64,
}

impl LambertConformal {
    /// Angles in degrees, spacings in metres. A negative spacing walks the
    /// grid westward (`dx`) or southward (`dy`) from the first point.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lat1_deg: f64,
        lon1_deg: f64,
        lov_deg: f64,
        latin1_deg: f64,
        latin2_deg: f64,
        dx: f64,
        dy: f64,
        earth_radius: f64,
    ) -> Self {
        let rad = PI / 180.0;
        let lat1 = lat1_deg * rad;
        let latin1 = latin1_deg * rad;
        let latin2 = latin2_deg * rad;

        let n = if (latin1 - latin2).abs() < 1e-10 {
            latin1.sin()
        } else {
            (latin1.cos() / latin2.cos()).ln()
                / ((PI / 4.0 + latin2 / 2.0).tan() / (PI / 4.0 + latin1 / 2.0).tan()).ln()
        };
        let f = latin1.cos() * (PI / 4.0 + latin1 / 2.0).tan().powf(n) / n;
        let rho0 = earth_radius * f / (PI / 4.0 + lat1 / 2.0).tan().powf(n);

        LambertConformal {
            lon0: lov_deg * rad,
            lon1: lon1_deg * rad,
            dx,
            dy,
            earth_radius,
            n,
            f,
            rho0,
        }
    }

    fn origin(&self) -> (f64, f64) {
        let theta0 = self.n * wrap_pi(self.lon1 - self.lon0);
        (self.rho0 * theta0.sin(), self.rho0 - self.rho0 * theta0.cos())
    }

    /// (lat, lon) in degrees of grid point (i, j).
    pub fn grid_to_geo(&self, i: f64, j: f64) -> (f64, f64) {
        let (x0, y0) = self.origin();
        let x = x0 + i * self.dx;
        let y = y0 + j * self.dy;

        let mut rho = (x * x + (self.rho0 - y) * (self.rho0 - y)).sqrt();
        if self.n < 0.0 {
            rho = -rho;
        }
        let theta = (x / (self.rho0 - y)).atan();

        let lat = 2.0 * (self.earth_radius * self.f / rho).powf(1.0 / self.n).atan() - PI / 2.0;
        let lon = self.lon0 + theta / self.n;

        (lat.to_degrees(), lon.to_degrees())
    }

    /// Fractional grid indices of a point, inverse of [`Self::grid_to_geo`].
    pub fn geo_to_grid(&self, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        let lat = lat_deg.to_radians();
        let rho = self.earth_radius * self.f / (PI / 4.0 + lat / 2.0).tan().powf(self.n);
        let theta = self.n * wrap_pi(lon_deg.to_radians() - self.lon0);

        let x = rho * theta.sin();
        let y = self.rho0 - rho * theta.cos();
        let (x0, y0) = self.origin();

        ((x - x0) / self.dx, (y - y0) / self.dy)
    }
}

fn wrap_pi(mut a: f64) -> f64 {
    while a > PI {
        a -= 2.0 * PI;
    }
    while a < -PI {
        a += 2.0 * PI;
    }
    a
}
