pub mod attendance;
pub mod backup;
pub mod core;
pub mod directory;
pub mod exams;
pub mod grades;
pub mod homework;
pub mod settings;
pub mod views;
