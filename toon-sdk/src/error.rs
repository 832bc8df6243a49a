use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Session error: {0}")]
    Session(#[from] toon_session::SessionError),

    #[error("Device error: {0}")]
    Device(#[from] toon_device::DeviceError),

    #[error("API error: {0}")]
    Api(#[from] toon_api::ApiError),

    #[error("Callback server error: {0}")]
    CallbackServer(#[from] callback_server::CallbackError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Hub is shut down")]
    ShutDown,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Pairing failed for {device_id}: {message}")]
    Pairing { device_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, HubError>;
