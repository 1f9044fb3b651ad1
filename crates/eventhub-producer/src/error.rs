use thiserror::Error;

pub type Result<T> = std::result::Result<T, PartitionResolverError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionResolverError {
    #[error("No partitions available for assignment")]
    NoPartitions,
}
