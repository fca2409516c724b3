pub mod openapi;
pub mod rest;
