pub mod detection;
pub mod user;

pub use detection::DetectionRepository;
pub use user::UserRepository;
