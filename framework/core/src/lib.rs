mod shutdown;

pub mod prelude {
    pub use crate::shutdown::{ShutdownHandle, ShutdownListener};
}
