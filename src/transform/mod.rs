use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use std::f64::consts::PI;

/// Converts a Cartesian point to (r, theta, z). theta comes straight from
/// `atan2(y, x)` and lies in (-π, π]; no wrapping is applied here.
pub fn to_cylindrical(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let r = (x * x + y * y).sqrt();
    let theta = y.atan2(x);
    (r, theta, z)
}

pub fn to_cartesian(r: f64, theta: f64, z: f64) -> (f64, f64, f64) {
    (r * theta.cos(), r * theta.sin(), z)
}

/// Wraps an angle into [-π, π).
pub fn wrap_angle(theta: f64) -> f64 {
    let two_pi = 2.0 * PI;
    let wrapped = (theta + PI).rem_euclid(two_pi) - PI;
    // rem_euclid may round up to exactly 2π for tiny negative inputs
    if wrapped >= PI {
        wrapped - two_pi
    } else {
        wrapped
    }
}

/// Rigid-body transform stored as a 4×4 homogeneous matrix.
///
/// A transform built with [`RigidTransform::world_to_local`] translates first
/// and rotates second: `p_local = Rᵀ (p_world − origin)`. Its inverse,
/// [`RigidTransform::local_to_world`], rotates first and translates second:
/// `p_world = R p_local + origin`. `R` holds the local axes as columns
/// expressed in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub matrix: Matrix4<f64>,
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    /// Translate by `-origin`, then rotate by `Rᵀ`.
    pub fn world_to_local(rotation: &Matrix3<f64>, origin: &Point3<f64>) -> Self {
        let rt = rotation.transpose();
        let t = -(rt * origin.coords);
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&rt);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
        Self { matrix }
    }

    /// Rotate by `R`, then translate by `origin`.
    pub fn local_to_world(rotation: &Matrix3<f64>, origin: &Point3<f64>) -> Self {
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&origin.coords);
        Self { matrix }
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    pub fn apply(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation() * point.coords + self.translation())
    }

    pub fn apply_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * vector
    }

    /// Closed-form inverse of a rigid transform (no general matrix inversion).
    pub fn inverse(&self) -> Self {
        let rt = self.rotation().transpose();
        let t = -(rt * self.translation());
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&rt);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
        Self { matrix }
    }

    /// `self.then(other)` applies `self` first and `other` second.
    pub fn then(&self, other: &RigidTransform) -> Self {
        Self {
            matrix: other.matrix * self.matrix,
        }
    }
}

/// Builds an orthonormal frame whose third column is `axis`. The first column
/// is `reference` projected onto the plane normal to `axis`; world y is used
/// instead when `reference` is (nearly) parallel to the axis.
pub fn frame_from_axis(axis: &Vector3<f64>, reference: &Vector3<f64>) -> Matrix3<f64> {
    let ez = axis.normalize();
    let mut ex = reference - ez * reference.dot(&ez);
    if ex.norm() < 1e-8 {
        let fallback = Vector3::y();
        ex = fallback - ez * fallback.dot(&ez);
    }
    if ex.norm() < 1e-8 {
        let fallback = Vector3::x();
        ex = fallback - ez * fallback.dot(&ez);
    }
    let ex = ex.normalize();
    let ey = ez.cross(&ex);
    Matrix3::from_columns(&[ex, ey, ez])
}

/// Rotation about the x axis followed by rotation about the y axis, applied to
/// column vectors: `Ry(beta) * Rx(alpha)`.
pub fn tilt_rotation(alpha: f64, beta: f64) -> Matrix3<f64> {
    let (sa, ca) = alpha.sin_cos();
    let (sb, cb) = beta.sin_cos();
    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, ca, -sa, 0.0, sa, ca);
    let ry = Matrix3::new(cb, 0.0, sb, 0.0, 1.0, 0.0, -sb, 0.0, cb);
    ry * rx
}
