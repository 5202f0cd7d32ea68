//! CPU-side mesh data

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Interleaved vertex as laid out in vertex buffers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    pub const fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }

    pub const fn stride() -> u32 {
        std::mem::size_of::<Self>() as u32
    }
}

/// A mesh with vertex and index data
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_indexed(&self) -> bool {
        !self.indices.is_empty()
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Full-screen triangle in clip space, no index buffer.
    pub fn fullscreen_triangle() -> Self {
        let mut mesh = Mesh::new("fullscreen_triangle");
        mesh.vertices = vec![
            Vertex::new(Vec3::new(-1.0, -1.0, 0.0), Vec3::Z, Vec2::new(0.0, 0.0)),
            Vertex::new(Vec3::new(3.0, -1.0, 0.0), Vec3::Z, Vec2::new(2.0, 0.0)),
            Vertex::new(Vec3::new(-1.0, 3.0, 0.0), Vec3::Z, Vec2::new(0.0, 2.0)),
        ];
        mesh
    }

    /// Unit quad on the XY plane facing +Z
    pub fn quad() -> Self {
        let mut mesh = Mesh::new("quad");
        mesh.vertices = vec![
            Vertex::new(Vec3::new(-0.5, -0.5, 0.0), Vec3::Z, Vec2::new(0.0, 1.0)),
            Vertex::new(Vec3::new(0.5, -0.5, 0.0), Vec3::Z, Vec2::new(1.0, 1.0)),
            Vertex::new(Vec3::new(0.5, 0.5, 0.0), Vec3::Z, Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec3::Z, Vec2::new(0.0, 0.0)),
        ];
        mesh.indices = vec![0, 1, 2, 0, 2, 3];
        mesh
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        // (normal, u axis, v axis) per face
        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];
        let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)];

        for (face, (normal, u_axis, v_axis)) in faces.into_iter().enumerate() {
            for (u, v) in corners {
                let position = normal * 0.5 + u_axis * u + v_axis * v;
                let uv = Vec2::new(u + 0.5, 0.5 - v);
                mesh.vertices.push(Vertex::new(position, normal, uv));
            }
            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(Vertex::stride(), 32);
    }

    #[test]
    fn cube_has_outward_faces() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.index_count(), 36);
        for vertex in &cube.vertices {
            assert!(vertex.position.dot(vertex.normal) > 0.0);
        }
    }

    #[test]
    fn byte_views_match_counts() {
        let quad = Mesh::quad();
        assert_eq!(quad.vertex_bytes().len(), 4 * Vertex::stride() as usize);
        assert_eq!(quad.index_bytes().len(), 6 * 4);
        assert!(!Mesh::fullscreen_triangle().is_indexed());
    }
}
