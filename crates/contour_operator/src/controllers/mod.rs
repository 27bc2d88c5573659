pub mod contour;
pub mod contour_controller;
pub mod ensure;
pub mod validation;
