mod btleplug_backend;
mod fake_backend;
mod hardware;
mod link_registry;
mod model;
mod session;

pub use self::fake_backend::{
    FakeBackendConfig, FakeEvent, FakeHardwareClient, FakeOperation, NotificationPayloads,
};
pub use self::hardware::{DeviceSession, HardwareClient, NotificationStream};
pub(crate) use self::hardware::{HardwareBackend, hardware_client_from_backend};
pub use self::link_registry::LinkRegistry;
pub(crate) use self::link_registry::SessionLease;
pub use self::model::{DeviceAddress, DeviceAddressError, FoundDevice};
