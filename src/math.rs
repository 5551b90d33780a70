//! Mathematical utilities and nalgebra extensions shared by both estimators
//!
//! Everything here is stateless. Callers are expected to guard degenerate
//! inputs (zero-length vectors and the like) before calling in.

use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};

/// Mathematical constants
pub const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
pub const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;

/// Standard gravity in m/s²
pub const GRAVITY: f32 = 9.81;

/// Quaternions shorter than this before normalization are treated as collapsed
pub const MIN_QUATERNION_NORM: f32 = 1.0e-3;

/// Extension trait for Vector3 operations
pub trait Vector3Ext {
    /// Convert degrees to radians
    fn deg_to_rad(&self) -> Vector3<f32>;

    /// Convert radians to degrees
    fn rad_to_deg(&self) -> Vector3<f32>;
}

impl Vector3Ext for Vector3<f32> {
    fn deg_to_rad(&self) -> Vector3<f32> {
        *self * DEG_TO_RAD
    }

    fn rad_to_deg(&self) -> Vector3<f32> {
        *self * RAD_TO_DEG
    }
}

/// Extension trait for UnitQuaternion operations
pub trait QuaternionExt {
    /// Convert quaternion to Euler angles (roll, pitch, yaw) in radians
    fn to_euler(&self) -> Vector3<f32>;

    /// Convert quaternion to Euler angles in degrees
    fn to_euler_degrees(&self) -> Vector3<f32>;

    /// Create quaternion from Euler angles in radians (ZYX order)
    fn from_euler(roll: f32, pitch: f32, yaw: f32) -> UnitQuaternion<f32>;

    /// Create quaternion from Euler angles in degrees (ZYX order)
    fn from_euler_degrees(roll: f32, pitch: f32, yaw: f32) -> UnitQuaternion<f32>;

    /// Flip the sign of all components if the scalar part is negative
    fn canonical(&self) -> UnitQuaternion<f32>;

    /// Rotation matrix taking body-frame vectors into the reference frame
    fn rotation_matrix(&self) -> Matrix3<f32>;

    /// Rotate a reference-frame vector into the body frame
    fn reference_to_body(&self, v: &Vector3<f32>) -> Vector3<f32>;
}

impl QuaternionExt for UnitQuaternion<f32> {
    fn to_euler(&self) -> Vector3<f32> {
        let (roll, pitch, yaw) = self.euler_angles();
        Vector3::new(roll, pitch, yaw)
    }

    fn to_euler_degrees(&self) -> Vector3<f32> {
        self.to_euler().rad_to_deg()
    }

    fn from_euler(roll: f32, pitch: f32, yaw: f32) -> UnitQuaternion<f32> {
        UnitQuaternion::from_euler_angles(roll, pitch, yaw)
    }

    fn from_euler_degrees(roll: f32, pitch: f32, yaw: f32) -> UnitQuaternion<f32> {
        let euler_rad = Vector3::new(roll, pitch, yaw).deg_to_rad();
        Self::from_euler(euler_rad.x, euler_rad.y, euler_rad.z)
    }

    fn canonical(&self) -> UnitQuaternion<f32> {
        if self.w < 0.0 {
            UnitQuaternion::new_unchecked(-*self.quaternion())
        } else {
            *self
        }
    }

    fn rotation_matrix(&self) -> Matrix3<f32> {
        self.to_rotation_matrix().into_inner()
    }

    fn reference_to_body(&self, v: &Vector3<f32>) -> Vector3<f32> {
        self.inverse_transform_vector(v)
    }
}

/// Quaternion from a proper rotation matrix (body to reference)
///
/// The result is canonicalized so that `w >= 0`.
pub fn quaternion_from_rotation_matrix(matrix: &Matrix3<f32>) -> UnitQuaternion<f32> {
    let rotation = Rotation3::from_matrix_unchecked(*matrix);
    UnitQuaternion::from_rotation_matrix(&rotation).canonical()
}

/// Renormalize a raw quaternion, canonicalize its sign, and fall back to
/// identity if it collapsed or went NaN
///
/// Returns the unit quaternion and whether the fallback fired.
///
/// # Example
/// ```
/// use nalgebra::Quaternion;
/// use fusion_nav::math::normalize_or_identity;
///
/// let (q, reset) = normalize_or_identity(Quaternion::new(-2.0, 0.0, 0.0, 0.0));
/// assert!(!reset);
/// assert_eq!(q.w, 1.0);
///
/// let (_, reset) = normalize_or_identity(Quaternion::new(f32::NAN, 0.0, 0.0, 0.0));
/// assert!(reset);
/// ```
pub fn normalize_or_identity(q: Quaternion<f32>) -> (UnitQuaternion<f32>, bool) {
    let norm = q.norm();
    if !norm.is_finite() || norm < MIN_QUATERNION_NORM {
        return (UnitQuaternion::identity(), true);
    }

    let q = if q.w < 0.0 { -q } else { q };
    (UnitQuaternion::new_unchecked(q / norm), false)
}

/// First-order quaternion integration of a body rate given in deg/s
///
/// `q + 0.5 * q ⊗ (0, ω) * dt`, left unnormalized.
pub fn integrate_rate(q: &Quaternion<f32>, rate_deg: &Vector3<f32>, dt: f32) -> Quaternion<f32> {
    let omega = Quaternion::from_parts(0.0, rate_deg.deg_to_rad());
    let derivative = q * omega * 0.5;
    q + derivative * dt
}

/// Rotation from two vector pairs (TRIAD)
///
/// Finds the body-to-reference rotation that best maps the body vectors
/// `primary_body` and `secondary_body` onto their reference-frame
/// counterparts. The primary pair is matched exactly, the secondary only
/// contributes its component orthogonal to the primary.
///
/// Returns `None` when either pair is degenerate (zero or collinear).
pub fn rotation_from_two_vectors(
    primary_body: &Vector3<f32>,
    primary_reference: &Vector3<f32>,
    secondary_body: &Vector3<f32>,
    secondary_reference: &Vector3<f32>,
) -> Option<UnitQuaternion<f32>> {
    let body = triad(primary_body, secondary_body)?;
    let reference = triad(primary_reference, secondary_reference)?;

    // R_nb = [reference triad] * [body triad]^T
    let rotation = reference * body.transpose();
    Some(quaternion_from_rotation_matrix(&rotation))
}

/// Orthonormal basis built from two non-collinear vectors, one per column
fn triad(primary: &Vector3<f32>, secondary: &Vector3<f32>) -> Option<Matrix3<f32>> {
    const MIN_LENGTH: f32 = 1.0e-6;

    let primary_length = primary.norm();
    if !(primary_length >= MIN_LENGTH) {
        return None;
    }
    let t1 = primary / primary_length;

    let normal = primary.cross(secondary);
    let normal_length = normal.norm();
    if !(normal_length >= MIN_LENGTH * primary_length.max(1.0) * secondary.norm().max(1.0)) {
        return None;
    }
    let t2 = normal / normal_length;
    let t3 = t1.cross(&t2);

    Some(Matrix3::from_columns(&[t1, t2, t3]))
}
