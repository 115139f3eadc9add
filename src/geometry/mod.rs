//! Client/service coordinate conventions and pose extraction.

pub mod convention;
pub mod pose;

pub use convention::{
    convert_matrix3, convert_matrix3x4, convert_matrix4, convert_pose, to_client_matrix4,
    to_client_pose, to_service_matrix4, to_service_pose,
};
pub use pose::{extract_pose, look_rotation, Client, ClientPose, Convention, Pose3D, Service, ServicePose};
