pub mod detector;
pub mod jobs;
pub mod notifications;
pub mod producer;
pub mod repository;
pub mod storage;
pub mod stream;
pub mod worker;
