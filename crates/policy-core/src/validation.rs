use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("duplicate path rule: {0}")]
    DuplicatePath(String),
    #[error("duplicate net rule: {0}")]
    DuplicateNet(String),
    #[error("duplicate unix rule: {0}")]
    DuplicateUnix(String),
    #[error("duplicate syscall allow entry: {0}")]
    DuplicateSyscall(String),
}

#[derive(Debug, Error)]
pub enum ValidationWarning {
    #[error("net rule {0} grants no access")]
    EmptyNetAccess(String),
    #[error("net rule {0} only allows create; its port and address are unused")]
    UnusedNetAddress(String),
    #[error("unix rule {0} grants no access")]
    EmptyUnixAccess(String),
    #[error("syscall {0} is already allowed by a profile")]
    RedundantSyscall(String),
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
