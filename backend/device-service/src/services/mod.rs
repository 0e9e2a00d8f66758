pub mod devices;

pub use devices::{
    ChangeDeviceStatusCommand, CreateDeviceCommand, DeviceService, DeviceView, ListDevicesQuery,
    PageMeta,
};
