// src/handlers/mod.rs

pub mod exam_session;
