pub mod clock;
pub mod delivery;
pub mod dispatch;
pub mod email;
pub mod init;
pub mod providers;
pub mod push;
pub mod scheduler;

#[cfg(test)]
pub mod testing;
