//! Plain geometric value types replicated by [`crate::value::ValueData`].

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Point2 {
    pub x: i64,
    pub y: i64,
}
impl Point2 {
    pub fn new(x: i64, y: i64) -> Point2 {
        Point2 { x, y }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Point3 {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}
impl Point3 {
    pub fn new(x: i64, y: i64, z: i64) -> Point3 {
        Point3 { x, y, z }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}
impl Vector2 {
    pub fn new(x: f64, y: f64) -> Vector2 {
        Vector2 { x, y }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}
impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Vector3 {
        Vector3 { x, y, z }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}
impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Quaternion {
        Quaternion { x, y, z, w }
    }
}
impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}
