use crate::domain::machines::models::{KeyPair, Machine, MachineRef, SaveMachineRequest};
use crate::error::Result;

// A machine repository stores remote hosts
pub trait MachineRepository: Send + Sync + 'static + Clone {
    fn save_machine(
        &self,
        req: &SaveMachineRequest,
    ) -> impl Future<Output = Result<Machine>> + Send;

    fn delete_machine(&self, machine: &MachineRef) -> impl Future<Output = Result<()>> + Send;

    fn list_machines(&self) -> impl Future<Output = Result<Vec<Machine>>> + Send;

    fn get_machine(&self, machine: &MachineRef) -> impl Future<Output = Result<Machine>> + Send;
}

// A key repository stores ssh key pairs
pub trait KeyRepository: Send + Sync + 'static + Clone {
    fn save_key(
        &self,
        name: &str,
        public_key: &[u8],
        private_key: &[u8],
    ) -> impl Future<Output = Result<KeyPair>> + Send;

    fn get_key(&self, name: &str) -> impl Future<Output = Result<KeyPair>> + Send;

    fn list_keys(&self) -> impl Future<Output = Result<Vec<KeyPair>>> + Send;

    fn delete_key(&self, name: &str) -> impl Future<Output = Result<()>> + Send;
}
