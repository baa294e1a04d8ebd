pub mod bucket;
pub mod gc;
pub mod multipart_service;
pub mod ops;
pub mod storage_service;
pub mod version;
