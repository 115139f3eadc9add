use std::fmt;
use std::marker::PhantomData;

use nalgebra::{Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Coordinate convention a pose is expressed in.
pub trait Convention: Copy + Default + fmt::Debug + Send + Sync + 'static {
    const NAME: &'static str;

    /// The convention on the other side of the Y flip
    type Other: Convention<Other = Self>;
}

/// Convention of the local AR scene (Y inverted relative to the service).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Client;

/// Convention of the remote relocalization service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Service;

impl Convention for Client {
    const NAME: &'static str = "client";
    type Other = Service;
}

impl Convention for Service {
    const NAME: &'static str = "service";
    type Other = Client;
}

/// Position and orientation tagged with the convention they are expressed in.
///
/// Poses of different conventions are distinct types; going from one to the
/// other requires [`crate::geometry::convert_pose`].
pub struct Pose3D<C: Convention> {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    _convention: PhantomData<C>,
}

pub type ClientPose = Pose3D<Client>;
pub type ServicePose = Pose3D<Service>;

impl<C: Convention> Pose3D<C> {
    pub fn new(position: Vector3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self {
            position,
            rotation,
            _convention: PhantomData,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Homogeneous transform of this pose.
    pub fn to_matrix(&self) -> Matrix4<f32> {
        Translation3::from(self.position).to_homogeneous() * self.rotation.to_homogeneous()
    }
}

// Manual impls so the marker type does not need to satisfy the bounds.
impl<C: Convention> Clone for Pose3D<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Convention> Copy for Pose3D<C> {}

impl<C: Convention> PartialEq for Pose3D<C> {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position && self.rotation == other.rotation
    }
}

impl<C: Convention> fmt::Debug for Pose3D<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pose3D")
            .field("convention", &C::NAME)
            .field("position", &self.position)
            .field("rotation", &self.rotation)
            .finish()
    }
}

impl<C: Convention> Default for Pose3D<C> {
    fn default() -> Self {
        Self::identity()
    }
}

/// Rotation whose local Z axis points along `forward` and local Y axis is as
/// close as possible to `up`.
///
/// Collinear or zero-length inputs have no defined orientation and produce
/// NaN components; callers are expected to pass a valid basis.
pub fn look_rotation(forward: &Vector3<f32>, up: &Vector3<f32>) -> UnitQuaternion<f32> {
    let z = forward.normalize();
    let x = up.cross(&z).normalize();
    let y = z.cross(&x);
    let basis = Rotation3::from_basis_unchecked(&[x, y, z]);
    UnitQuaternion::from_rotation_matrix(&basis)
}

/// Extracts a pose from a homogeneous transform.
///
/// The position is the last column. The orientation is rebuilt from the
/// forward (third) and up (second) columns with [`look_rotation`], so scale
/// and skew in the upper 3x3 block are discarded rather than decomposed.
pub fn extract_pose<C: Convention>(matrix: &Matrix4<f32>) -> Pose3D<C> {
    let position = matrix.fixed_view::<3, 1>(0, 3).into_owned();
    let up = matrix.fixed_view::<3, 1>(0, 1).into_owned();
    let forward = matrix.fixed_view::<3, 1>(0, 2).into_owned();
    Pose3D::new(position, look_rotation(&forward, &up))
}
