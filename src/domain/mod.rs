pub mod image_updates;
pub mod machines;
pub mod user_config;

use crate::domain::image_updates::ports::ImageUpdateRepository;
use crate::domain::machines::ports::{KeyRepository, MachineRepository};
use crate::domain::user_config::UserConfigRepository;

/// Everything the application persists.
pub trait Store:
    MachineRepository + KeyRepository + ImageUpdateRepository + UserConfigRepository
{
}

impl<T> Store for T where
    T: MachineRepository + KeyRepository + ImageUpdateRepository + UserConfigRepository
{
}
