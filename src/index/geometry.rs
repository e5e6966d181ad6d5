//! Boxes, planes and frusta in volume space, and box visibility tests.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Classification of a box against a view volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Invisible,
    Intersecting,
    FullyVisible,
}

/// Axis-aligned box. `min` is inclusive, `max` exclusive for overlap tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn scaled(&self, factor: Vec3) -> Aabb {
        Aabb::new(self.min * factor, self.max * factor)
    }

    /// Overlap with positive volume; touching faces do not count.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmplt(other.max).all() && other.min.cmplt(self.max).all()
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && other.max.cmple(self.max).all()
    }
}

/// A half-space in Hessian normal form; points with positive distance are inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    pub fn new(normal: Vec3, d: f32) -> Self {
        Self { normal, d }
    }

    /// Signed distance from point to plane (positive = in front).
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }

    /// Classify a box using its corners nearest and farthest along the normal.
    pub fn classify(&self, aabb: &Aabb) -> Visibility {
        let n = self.normal;
        let positive = Vec3::select(n.cmpge(Vec3::ZERO), aabb.max, aabb.min);
        let negative = Vec3::select(n.cmpge(Vec3::ZERO), aabb.min, aabb.max);

        if self.distance_to_point(positive) < 0.0 {
            Visibility::Invisible
        } else if self.distance_to_point(negative) >= 0.0 {
            Visibility::FullyVisible
        } else {
            Visibility::Intersecting
        }
    }
}

/// 6-plane frustum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    pub planes: [Plane; 6], // left, right, bottom, top, near, far
}

impl Frustum {
    pub fn from_planes(planes: [Plane; 6]) -> Self {
        Self { planes }
    }

    /// Extract frustum planes from a view-projection matrix.
    /// Uses the Gribb/Hartmann method.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];
        let raw: [Vec4; 6] = [
            rows[3] + rows[0], // left
            rows[3] - rows[0], // right
            rows[3] + rows[1], // bottom
            rows[3] - rows[1], // top
            rows[3] + rows[2], // near
            rows[3] - rows[2], // far
        ];

        let mut planes = [Plane::new(Vec3::ZERO, 0.0); 6];
        for (plane, r) in planes.iter_mut().zip(raw.iter()) {
            let normal = r.truncate();
            let len = normal.length();
            if len > 0.0 {
                *plane = Plane::new(normal / len, r.w / len);
            }
        }
        Self { planes }
    }

    pub fn classify(&self, aabb: &Aabb) -> Visibility {
        let mut result = Visibility::FullyVisible;
        for plane in &self.planes {
            match plane.classify(aabb) {
                Visibility::Invisible => return Visibility::Invisible,
                Visibility::Intersecting => result = Visibility::Intersecting,
                Visibility::FullyVisible => {}
            }
        }
        result
    }
}

/// Anything boxes can be classified against.
pub trait ViewVolume {
    fn classify(&self, aabb: &Aabb) -> Visibility;
}

impl ViewVolume for Aabb {
    fn classify(&self, aabb: &Aabb) -> Visibility {
        if !self.intersects(aabb) {
            Visibility::Invisible
        } else if self.contains(aabb) {
            Visibility::FullyVisible
        } else {
            Visibility::Intersecting
        }
    }
}

impl ViewVolume for Frustum {
    fn classify(&self, aabb: &Aabb) -> Visibility {
        Frustum::classify(self, aabb)
    }
}

/// Region of interest for a spatial query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ViewRegion {
    Box(Aabb),
    Frustum(Frustum),
}

impl ViewVolume for ViewRegion {
    fn classify(&self, aabb: &Aabb) -> Visibility {
        match self {
            ViewRegion::Box(b) => ViewVolume::classify(b, aabb),
            ViewRegion::Frustum(f) => f.classify(aabb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(min: f32, max: f32) -> Aabb {
        Aabb::new(Vec3::splat(min), Vec3::splat(max))
    }

    #[test]
    fn test_plane_classification() {
        // x >= 0
        let plane = Plane::new(Vec3::X, 0.0);
        assert_eq!(plane.classify(&unit_box(1.0, 2.0)), Visibility::FullyVisible);
        assert_eq!(plane.classify(&unit_box(-1.0, 1.0)), Visibility::Intersecting);
        assert_eq!(plane.classify(&unit_box(-3.0, -2.0)), Visibility::Invisible);

        // x <= 5, normal pointing -x
        let plane = Plane::new(-Vec3::X, 5.0);
        assert_eq!(plane.classify(&unit_box(1.0, 2.0)), Visibility::FullyVisible);
        assert_eq!(plane.classify(&unit_box(4.0, 6.0)), Visibility::Intersecting);
        assert_eq!(plane.classify(&unit_box(6.0, 7.0)), Visibility::Invisible);
    }

    #[test]
    fn test_aabb_region() {
        let region = unit_box(0.0, 10.0);
        assert_eq!(ViewVolume::classify(&region, &unit_box(2.0, 3.0)), Visibility::FullyVisible);
        assert_eq!(ViewVolume::classify(&region, &unit_box(9.0, 12.0)), Visibility::Intersecting);
        assert_eq!(ViewVolume::classify(&region, &unit_box(10.0, 12.0)), Visibility::Invisible);
    }

    #[test]
    fn test_frustum_from_view_projection() {
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_3, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_projection(&proj);

        for plane in &frustum.planes {
            assert!(plane.normal.length() > 0.9, "Plane normal should be normalized");
        }

        let ahead = Aabb::new(Vec3::new(-1.0, -1.0, -10.0), Vec3::new(1.0, 1.0, -5.0));
        assert_eq!(frustum.classify(&ahead), Visibility::FullyVisible);

        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 5.0), Vec3::new(1.0, 1.0, 10.0));
        assert_eq!(frustum.classify(&behind), Visibility::Invisible);

        let straddling = Aabb::new(Vec3::new(-1.0, -1.0, -120.0), Vec3::new(1.0, 1.0, -50.0));
        assert_eq!(frustum.classify(&straddling), Visibility::Intersecting);
    }

    #[test]
    fn test_union_and_center() {
        let a = unit_box(0.0, 1.0);
        let b = unit_box(2.0, 4.0);
        let u = a.union(&b);
        assert_eq!(u, unit_box(0.0, 4.0));
        assert_eq!(u.center(), Vec3::splat(2.0));
    }
}
