pub type AnyError = anyhow::Error;

pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;
