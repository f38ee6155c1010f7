//! Binary navigation mesh format
//!
//! Little-endian encoding of a complete [`NavMesh`]: header, vertices,
//! polygons, links, detail mesh and off-mesh connections.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;
use navmesh_common::{Error, Result};

use crate::nav_mesh::{Link, OffMeshLink, Poly, PolyDetail, LINK_EDGE_OFF_MESH};
use crate::{NavMesh, PolyFlags, PolyRef, PolyType, MAX_VERTS_PER_POLY};

/// Magic number of navigation mesh blobs ('NAVM')
pub const NAVMESH_MAGIC: u32 = u32::from_le_bytes(*b"NAVM");

/// Current navigation mesh blob version
pub const NAVMESH_VERSION: u32 = 1;

/// Null link value
const NULL_LINK: u32 = 0xffff_ffff;

/// Upper bound of up-front allocations while decoding.
const MAX_PREALLOC: usize = 1 << 16;

/// Blob header
#[derive(Debug, Clone, Default)]
struct MeshHeader {
    magic: u32,
    version: u32,
    vert_count: u32,
    poly_count: u32,
    link_count: u32,
    detail_mesh_count: u32,
    detail_vert_count: u32,
    detail_tri_count: u32,
    off_mesh_count: u32,
    walkable_height: f32,
    walkable_radius: f32,
    walkable_climb: f32,
    bmin: Vec3,
    bmax: Vec3,
}

impl MeshHeader {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        for count in [
            self.vert_count,
            self.poly_count,
            self.link_count,
            self.detail_mesh_count,
            self.detail_vert_count,
            self.detail_tri_count,
            self.off_mesh_count,
        ] {
            writer.write_u32::<LittleEndian>(count)?;
        }
        writer.write_f32::<LittleEndian>(self.walkable_height)?;
        writer.write_f32::<LittleEndian>(self.walkable_radius)?;
        writer.write_f32::<LittleEndian>(self.walkable_climb)?;
        write_vec3(writer, self.bmin)?;
        write_vec3(writer, self.bmax)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != NAVMESH_MAGIC {
            return Err(Error::Serialization(format!(
                "invalid navigation mesh magic {magic:#010x}"
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != NAVMESH_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported navigation mesh version {version} (expected {NAVMESH_VERSION})"
            )));
        }
        Ok(Self {
            magic,
            version,
            vert_count: reader.read_u32::<LittleEndian>()?,
            poly_count: reader.read_u32::<LittleEndian>()?,
            link_count: reader.read_u32::<LittleEndian>()?,
            detail_mesh_count: reader.read_u32::<LittleEndian>()?,
            detail_vert_count: reader.read_u32::<LittleEndian>()?,
            detail_tri_count: reader.read_u32::<LittleEndian>()?,
            off_mesh_count: reader.read_u32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bmin: read_vec3(reader)?,
            bmax: read_vec3(reader)?,
        })
    }
}

fn write_vec3<W: Write>(writer: &mut W, v: Vec3) -> Result<()> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)?;
    Ok(())
}

fn read_vec3<R: Read>(reader: &mut R) -> Result<Vec3> {
    Ok(Vec3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn write_link_index<W: Write>(writer: &mut W, link: Option<u32>) -> Result<()> {
    writer.write_u32::<LittleEndian>(link.unwrap_or(NULL_LINK))?;
    Ok(())
}

fn read_link_index<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let v = reader.read_u32::<LittleEndian>()?;
    Ok((v != NULL_LINK).then_some(v))
}

fn read_items<R: Read, T>(
    reader: &mut R,
    count: u32,
    mut read: impl FnMut(&mut R) -> Result<T>,
) -> Result<Vec<T>> {
    let mut items = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        items.push(read(reader)?);
    }
    Ok(items)
}

impl Poly {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_link_index(writer, self.first_link)?;
        for &v in &self.verts {
            writer.write_u16::<LittleEndian>(v)?;
        }
        for &n in &self.neighbors {
            writer.write_u16::<LittleEndian>(n)?;
        }
        writer.write_u16::<LittleEndian>(self.flags.bits())?;
        writer.write_u8(self.vert_count)?;
        writer.write_u8(self.area)?;
        writer.write_u8(self.poly_type as u8)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let first_link = read_link_index(reader)?;
        let mut verts = [0u16; MAX_VERTS_PER_POLY];
        for v in &mut verts {
            *v = reader.read_u16::<LittleEndian>()?;
        }
        let mut neighbors = [0u16; MAX_VERTS_PER_POLY];
        for n in &mut neighbors {
            *n = reader.read_u16::<LittleEndian>()?;
        }
        let flags = PolyFlags::from_bits_retain(reader.read_u16::<LittleEndian>()?);
        let vert_count = reader.read_u8()?;
        let area = reader.read_u8()?;
        let poly_type = match reader.read_u8()? {
            0 => PolyType::Ground,
            1 => PolyType::OffMeshConnection,
            other => {
                return Err(Error::Serialization(format!("invalid polygon type {other}")));
            }
        };
        Ok(Self {
            first_link,
            verts,
            neighbors,
            flags,
            vert_count,
            area,
            poly_type,
        })
    }
}

impl Link {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.reference.id())?;
        write_link_index(writer, self.next)?;
        writer.write_u8(self.edge)?;
        writer.write_u8(self.side)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            reference: PolyRef::new(reader.read_u32::<LittleEndian>()?),
            next: read_link_index(reader)?,
            edge: reader.read_u8()?,
            side: reader.read_u8()?,
        })
    }
}

impl PolyDetail {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.vert_base)?;
        writer.write_u32::<LittleEndian>(self.tri_base)?;
        writer.write_u8(self.vert_count)?;
        writer.write_u8(self.tri_count)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            vert_base: reader.read_u32::<LittleEndian>()?,
            tri_base: reader.read_u32::<LittleEndian>()?,
            vert_count: reader.read_u8()?,
            tri_count: reader.read_u8()?,
        })
    }
}

impl OffMeshLink {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_vec3(writer, self.pos[0])?;
        write_vec3(writer, self.pos[1])?;
        writer.write_f32::<LittleEndian>(self.radius)?;
        writer.write_u16::<LittleEndian>(self.poly)?;
        writer.write_u8(self.bidirectional as u8)?;
        writer.write_u32::<LittleEndian>(self.user_id)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            pos: [read_vec3(reader)?, read_vec3(reader)?],
            radius: reader.read_f32::<LittleEndian>()?,
            poly: reader.read_u16::<LittleEndian>()?,
            bidirectional: reader.read_u8()? != 0,
            user_id: reader.read_u32::<LittleEndian>()?,
        })
    }
}

fn count(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Serialization(format!("too many {what} ({len})")))
}

impl NavMesh {
    /// Writes the navigation mesh in the binary format
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let header = MeshHeader {
            magic: NAVMESH_MAGIC,
            version: NAVMESH_VERSION,
            vert_count: count(self.verts.len(), "vertices")?,
            poly_count: count(self.polys.len(), "polygons")?,
            link_count: count(self.links.len(), "links")?,
            detail_mesh_count: count(self.detail_meshes.len(), "detail meshes")?,
            detail_vert_count: count(self.detail_verts.len(), "detail vertices")?,
            detail_tri_count: count(self.detail_tris.len(), "detail triangles")?,
            off_mesh_count: count(self.off_mesh.len(), "off-mesh connections")?,
            walkable_height: self.walkable_height,
            walkable_radius: self.walkable_radius,
            walkable_climb: self.walkable_climb,
            bmin: self.bmin,
            bmax: self.bmax,
        };
        header.write_to(writer)?;

        for &v in &self.verts {
            write_vec3(writer, v)?;
        }
        for poly in &self.polys {
            poly.write_to(writer)?;
        }
        for link in &self.links {
            link.write_to(writer)?;
        }
        for detail in &self.detail_meshes {
            detail.write_to(writer)?;
        }
        for &v in &self.detail_verts {
            write_vec3(writer, v)?;
        }
        for tri in &self.detail_tris {
            writer.write_all(tri)?;
        }
        for con in &self.off_mesh {
            con.write_to(writer)?;
        }
        Ok(())
    }

    /// Reads a navigation mesh written by [`NavMesh::write_to`]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header = MeshHeader::read_from(reader)?;

        let verts = read_items(reader, header.vert_count, |r| read_vec3(r))?;
        let polys = read_items(reader, header.poly_count, |r| Poly::read_from(r))?;
        let links = read_items(reader, header.link_count, |r| Link::read_from(r))?;
        let detail_meshes =
            read_items(reader, header.detail_mesh_count, |r| PolyDetail::read_from(r))?;
        let detail_verts = read_items(reader, header.detail_vert_count, |r| read_vec3(r))?;
        let detail_tris = read_items(reader, header.detail_tri_count, |r| {
            let mut tri = [0u8; 4];
            r.read_exact(&mut tri)?;
            Ok(tri)
        })?;
        let off_mesh = read_items(reader, header.off_mesh_count, |r| OffMeshLink::read_from(r))?;

        let mesh = NavMesh {
            verts,
            polys,
            links,
            detail_meshes,
            detail_verts,
            detail_tris,
            off_mesh,
            bmin: header.bmin,
            bmax: header.bmax,
            walkable_height: header.walkable_height,
            walkable_radius: header.walkable_radius,
            walkable_climb: header.walkable_climb,
        };
        mesh.check_integrity()?;
        Ok(mesh)
    }

    /// Encodes the navigation mesh into a byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.write_to(&mut data)?;
        Ok(data)
    }

    /// Decodes a navigation mesh from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        Self::read_from(&mut cursor)
    }

    /// Checks that every index in the decoded mesh is in range, so that
    /// queries on it cannot index out of bounds.
    fn check_integrity(&self) -> Result<()> {
        let corrupt = |what: String| Err(Error::Serialization(format!("corrupt navigation mesh: {what}")));
        let npolys = self.polys.len();
        let nlinks = self.links.len() as u32;
        for (i, poly) in self.polys.iter().enumerate() {
            let nv = poly.vert_count as usize;
            let min_verts = if poly.is_off_mesh() { 2 } else { 3 };
            if nv < min_verts || nv > MAX_VERTS_PER_POLY {
                return corrupt(format!("polygon {i} has {nv} vertices"));
            }
            if poly.verts[..nv].iter().any(|&v| v as usize >= self.verts.len()) {
                return corrupt(format!("polygon {i} vertex out of range"));
            }
            if poly.neighbors[..nv].iter().any(|&n| n as usize > npolys) {
                return corrupt(format!("polygon {i} neighbour out of range"));
            }
            if poly.first_link.is_some_and(|l| l >= nlinks) {
                return corrupt(format!("polygon {i} link out of range"));
            }
        }
        for (i, link) in self.links.iter().enumerate() {
            if link.next.is_some_and(|l| l >= nlinks)
                || !link.reference.index().is_some_and(|p| p < npolys)
            {
                return corrupt(format!("link {i} out of range"));
            }
        }
        for (i, poly) in self.polys.iter().enumerate() {
            let mut next = poly.first_link;
            let mut steps = 0;
            while let Some(l) = next {
                steps += 1;
                if steps > self.links.len() {
                    return corrupt(format!("polygon {i} link chain loops"));
                }
                let link = &self.links[l as usize];
                let to_off_mesh = link
                    .reference
                    .index()
                    .is_some_and(|p| self.polys[p].is_off_mesh());
                // Off-mesh polygons link from their endpoints; ground
                // polygons from an edge, or from no edge into an off-mesh one.
                let edge_ok = if poly.is_off_mesh() {
                    link.edge <= 1
                } else if link.edge == LINK_EDGE_OFF_MESH {
                    to_off_mesh
                } else {
                    link.edge < poly.vert_count
                };
                if !edge_ok {
                    return corrupt(format!("polygon {i} link {l} on edge {}", link.edge));
                }
                next = link.next;
            }
        }
        if self.detail_meshes.len() > npolys {
            return corrupt("more detail meshes than polygons".to_string());
        }
        for (i, d) in self.detail_meshes.iter().enumerate() {
            let verts_end = d.vert_base as usize + d.vert_count as usize;
            let tris_end = d.tri_base as usize + d.tri_count as usize;
            if verts_end > self.detail_verts.len() || tris_end > self.detail_tris.len() {
                return corrupt(format!("detail mesh {i} out of range"));
            }
            let tris = &self.detail_tris[d.tri_base as usize..tris_end];
            if tris.iter().any(|t| t[..3].iter().any(|&v| v >= d.vert_count)) {
                return corrupt(format!("detail mesh {i} triangle out of range"));
            }
        }
        if self.off_mesh.iter().any(|c| c.poly as usize >= npolys) {
            return corrupt("off-mesh connection polygon out of range".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{create_grid_navmesh, islands_params};
    use crate::{NavMeshCreateParams, OffMeshConnection, QueryFilter};
    use std::io::Cursor;

    fn assert_same_mesh(a: &NavMesh, b: &NavMesh) {
        assert_eq!(a.verts, b.verts);
        assert_eq!(a.polys, b.polys);
        assert_eq!(a.links, b.links);
        assert_eq!(a.detail_meshes, b.detail_meshes);
        assert_eq!(a.detail_verts, b.detail_verts);
        assert_eq!(a.detail_tris, b.detail_tris);
        assert_eq!(a.off_mesh, b.off_mesh);
        assert_eq!(a.bounds(), b.bounds());
        assert_eq!(a.walkable_climb(), b.walkable_climb());
    }

    fn mesh_with_connection() -> NavMesh {
        let mut params: NavMeshCreateParams = islands_params();
        let mut con = OffMeshConnection::new(
            Vec3::new(2.5, 0.0, 1.5),
            Vec3::new(5.5, 0.0, 1.5),
            0.5,
            true,
            crate::POLYAREA_JUMP,
            PolyFlags::JUMP,
        )
        .unwrap();
        con.user_id = 77;
        params.off_mesh.push(con);
        NavMesh::create(&params).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let mesh = mesh_with_connection();
        let bytes = mesh.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"NAVM");
        let back = NavMesh::from_bytes(&bytes).unwrap();
        assert_same_mesh(&mesh, &back);

        let filter = QueryFilter::default();
        let p = Vec3::new(1.5, 0.0, 1.5);
        assert_eq!(
            mesh.find_nearest_poly(p, Vec3::splat(1.0), &filter),
            back.find_nearest_poly(p, Vec3::splat(1.0), &filter)
        );
    }

    #[test]
    fn test_rejects_wrong_magic_and_version() {
        let mesh = create_grid_navmesh(2, 1.0).unwrap();
        let mut bytes = mesh.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            NavMesh::from_bytes(&bytes),
            Err(Error::Serialization(_))
        ));

        let mut bytes = mesh.to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&(NAVMESH_VERSION + 1).to_le_bytes());
        assert!(matches!(
            NavMesh::from_bytes(&bytes),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_and_corrupt_data() {
        let mesh = create_grid_navmesh(2, 1.0).unwrap();
        let bytes = mesh.to_bytes().unwrap();
        assert!(NavMesh::from_bytes(&bytes[..bytes.len() - 3]).is_err());

        let mut corrupt = mesh.clone();
        corrupt.polys[0].verts[0] = 999;
        let bytes = corrupt.to_bytes().unwrap();
        assert!(matches!(
            NavMesh::from_bytes(&bytes),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_link_edges_outside_polygon() {
        let mesh = create_grid_navmesh(3, 1.0).unwrap();
        let mut corrupt = mesh.clone();
        for link in &mut corrupt.links {
            link.edge = 200;
        }
        assert!(matches!(
            NavMesh::from_bytes(&corrupt.to_bytes().unwrap()),
            Err(Error::Serialization(_))
        ));

        // Only links into off-mesh polygons may skip the edge.
        let mut corrupt = mesh.clone();
        corrupt.links[0].edge = LINK_EDGE_OFF_MESH;
        assert!(NavMesh::from_bytes(&corrupt.to_bytes().unwrap()).is_err());

        let mut looped = mesh.clone();
        let first = looped.polys[0].first_link.unwrap();
        looped.links[first as usize].next = Some(first);
        assert!(NavMesh::from_bytes(&looped.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_off_mesh_link_past_endpoints() {
        let mesh = mesh_with_connection();
        assert!(NavMesh::from_bytes(&mesh.to_bytes().unwrap()).is_ok());

        let con = mesh.off_mesh[0].poly as usize;
        let mut corrupt = mesh.clone();
        let first = corrupt.polys[con].first_link.unwrap();
        corrupt.links[first as usize].edge = 2;
        assert!(matches!(
            NavMesh::from_bytes(&corrupt.to_bytes().unwrap()),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let mesh = mesh_with_connection();
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer = std::io::BufWriter::new(file.reopen().unwrap());
            mesh.write_to(&mut writer).unwrap();
        }
        let data = std::fs::read(file.path()).unwrap();
        let back = NavMesh::read_from(&mut Cursor::new(data)).unwrap();
        assert_same_mesh(&mesh, &back);
    }

    #[test]
    fn test_empty_mesh_round_trip() {
        let mesh = NavMesh::empty();
        let back = NavMesh::from_bytes(&mesh.to_bytes().unwrap()).unwrap();
        assert!(back.is_empty());
    }
}
