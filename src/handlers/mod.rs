pub mod access;
pub mod callback;
pub mod commands;
pub mod responses;

#[cfg(test)]
pub mod test_support;
