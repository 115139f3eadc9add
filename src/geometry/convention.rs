//! Conversions between the client and service coordinate conventions.
//!
//! The two conventions differ by the sign of the Y axis. Every conversion is
//! the similarity `S * M * S` with `S = diag(1, -1, 1[, 1])`: an entry is
//! negated exactly when its row or its column (but not both) is the Y axis.
//! The flip is its own inverse, so the same operation converts both ways.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Quaternion, UnitQuaternion, Vector3};

use super::pose::{Client, Convention, Pose3D, Service};

const FLIPPED_AXIS: usize = 1;

#[inline]
fn flip_sign(row: usize, col: usize) -> f32 {
    if (row == FLIPPED_AXIS) != (col == FLIPPED_AXIS) {
        -1.0
    } else {
        1.0
    }
}

/// Flips the Y axis of a rotation block.
pub fn convert_matrix3(m: &Matrix3<f32>) -> Matrix3<f32> {
    m.map_with_location(|r, c, v| flip_sign(r, c) * v)
}

/// Flips the Y axis of a rotation + translation block.
///
/// The fourth column is the translation; its Y entry is negated.
pub fn convert_matrix3x4(m: &Matrix3x4<f32>) -> Matrix3x4<f32> {
    m.map_with_location(|r, c, v| flip_sign(r, c) * v)
}

/// Flips the Y axis of a homogeneous transform, including the last row.
pub fn convert_matrix4(m: &Matrix4<f32>) -> Matrix4<f32> {
    m.map_with_location(|r, c, v| flip_sign(r, c) * v)
}

pub fn to_service_matrix4(client: &Matrix4<f32>) -> Matrix4<f32> {
    convert_matrix4(client)
}

pub fn to_client_matrix4(service: &Matrix4<f32>) -> Matrix4<f32> {
    convert_matrix4(service)
}

/// Same flip as [`convert_matrix4`], applied to a position and quaternion.
///
/// Mirroring the Y axis negates the Y position and the X and Z rotation
/// components, which leaves rotations about Y untouched.
pub fn convert_pose<C: Convention>(pose: &Pose3D<C>) -> Pose3D<C::Other> {
    let p = pose.position;
    let q = pose.rotation;
    Pose3D::new(
        Vector3::new(p.x, -p.y, p.z),
        UnitQuaternion::new_unchecked(Quaternion::new(q.w, -q.i, q.j, -q.k)),
    )
}

pub fn to_service_pose(pose: &Pose3D<Client>) -> Pose3D<Service> {
    convert_pose(pose)
}

pub fn to_client_pose(pose: &Pose3D<Service>) -> Pose3D<Client> {
    convert_pose(pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::extract_pose;
    use approx::assert_relative_eq;

    fn sample_rotations() -> Vec<UnitQuaternion<f32>> {
        vec![
            UnitQuaternion::identity(),
            UnitQuaternion::from_euler_angles(0.4, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, -1.2, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 2.9),
            UnitQuaternion::from_euler_angles(-0.7, 1.3, 0.25),
        ]
    }

    #[test]
    fn test_sign_pattern() {
        let m = Matrix4::from_element(1.0);
        let expected = Matrix4::new(
            1.0, -1.0, 1.0, 1.0, //
            -1.0, 1.0, -1.0, -1.0, //
            1.0, -1.0, 1.0, 1.0, //
            1.0, -1.0, 1.0, 1.0,
        );
        assert_eq!(convert_matrix4(&m), expected);

        let m = Matrix3x4::from_element(1.0);
        let converted = convert_matrix3x4(&m);
        assert_eq!(converted[(1, 3)], -1.0);
        assert_eq!(converted[(0, 3)], 1.0);
        assert_eq!(converted[(2, 3)], 1.0);
    }

    #[test]
    fn test_matrix3_round_trip_preserves_orthonormality() {
        for q in sample_rotations() {
            let m = *q.to_rotation_matrix().matrix();
            let service = convert_matrix3(&m);
            assert_relative_eq!(service * service.transpose(), Matrix3::identity(), epsilon = 1e-5);
            assert_relative_eq!(service.determinant(), 1.0, epsilon = 1e-5);
            assert_relative_eq!(convert_matrix3(&service), m, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_matrix3x4_and_matrix4_round_trip() {
        for q in sample_rotations() {
            let client: Pose3D<Client> = Pose3D::new(Vector3::new(0.5, 1.5, -3.0), q);
            let m4 = client.to_matrix();
            let back = to_client_matrix4(&to_service_matrix4(&m4));
            assert_relative_eq!(back, m4, epsilon = 1e-6);

            let m34: Matrix3x4<f32> = m4.fixed_view::<3, 4>(0, 0).into_owned();
            let converted = convert_matrix3x4(&m34);
            assert_relative_eq!(converted[(1, 3)], -1.5, epsilon = 1e-6);
            assert_relative_eq!(convert_matrix3x4(&converted), m34, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_pose_conversion_matches_matrix_conversion() {
        for q in sample_rotations() {
            let client: Pose3D<Client> = Pose3D::new(Vector3::new(-1.0, 2.0, 4.0), q);
            let via_pose = to_service_pose(&client);
            let via_matrix: Pose3D<Service> = extract_pose(&to_service_matrix4(&client.to_matrix()));

            assert_relative_eq!(via_pose.position, via_matrix.position, epsilon = 1e-6);
            assert_relative_eq!(via_pose.rotation.angle_to(&via_matrix.rotation), 0.0, epsilon = 2e-3);
            assert_relative_eq!(via_pose.rotation.norm(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_convert_pose_always_switches_convention() {
        fn convention_of<C: Convention>(_: &Pose3D<C>) -> &'static str {
            C::NAME
        }

        let client: Pose3D<Client> = Pose3D::new(Vector3::new(1.0, 2.0, 3.0), UnitQuaternion::identity());
        let service = convert_pose(&client);
        assert_eq!(convention_of(&service), Service::NAME);
        assert_eq!(service.position, Vector3::new(1.0, -2.0, 3.0));

        let back = convert_pose(&service);
        assert_eq!(convention_of(&back), Client::NAME);
        assert_eq!(back, client);
    }

    #[test]
    fn test_rotation_about_flipped_axis_is_unchanged() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.8);
        let client: Pose3D<Client> = Pose3D::new(Vector3::zeros(), q);
        let service = to_service_pose(&client);
        assert_relative_eq!(service.rotation.angle_to(&q), 0.0, epsilon = 2e-3);

        let back = to_client_pose(&service);
        assert_eq!(back, client);
    }
}
