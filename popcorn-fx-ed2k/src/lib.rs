pub mod transfer;

#[cfg(test)]
pub mod testing;
