//! Navmesh snapshot files
//!
//! A snapshot holds everything needed to continue working with a built
//! navigation mesh: build settings, partition type, input geometry, area
//! markup and the navigation mesh itself. Little endian throughout.
//!
//! Layout: magic `NMSH`, version, settings (13 floats in key order),
//! partition, extra erosion, median filter flag, geometry, convex volumes,
//! off-mesh connections, navigation mesh blob.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;
use navmesh_common::{Error, Result};
use navmesh_detour::{NavMesh, OffMeshConnection, OffMeshConnectionSet, PolyFlags};
use navmesh_recast::{BuildSettings, ConvexVolume, ConvexVolumeSet, PartitionType};

use crate::geometry::InputGeometry;

/// Magic number of snapshot files ('NMSH')
pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"NMSH");

/// Current snapshot version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Extension snapshot files must carry
pub const SNAPSHOT_EXTENSION: &str = "bin";

/// Upper bound of up-front allocations while decoding.
const MAX_PREALLOC: usize = 1 << 16;

/// Saved state of a [`crate::Navmesh`]
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub settings: BuildSettings,
    pub partition: PartitionType,
    /// Extra erosion radius in voxels
    pub extra_erosion: i32,
    pub median_filter: bool,
    pub geometry: Option<InputGeometry>,
    pub volumes: ConvexVolumeSet,
    pub off_mesh: OffMeshConnectionSet,
    pub nav_mesh: Arc<NavMesh>,
}

/// Checks that `path` ends in `.bin`, ignoring case.
pub fn check_extension(path: &Path) -> Result<()> {
    let ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(SNAPSHOT_EXTENSION));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "snapshot path {} must have a .{SNAPSHOT_EXTENSION} extension",
            path.display()
        )))
    }
}

impl Snapshot {
    /// Writes the snapshot to a `.bin` file.
    pub fn save(&self, path: &Path) -> Result<()> {
        check_extension(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        log::debug!("saved navmesh snapshot to {}", path.display());
        Ok(())
    }

    /// Reads a snapshot written by [`Snapshot::save`].
    pub fn load(path: &Path) -> Result<Self> {
        check_extension(path)?;
        let mut reader = BufReader::new(File::open(path)?);
        let snapshot = Self::read_from(&mut reader)?;
        log::debug!("loaded navmesh snapshot from {}", path.display());
        Ok(snapshot)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;

        for (_, value) in self.settings.entries() {
            writer.write_f32::<LittleEndian>(value)?;
        }
        writer.write_u8(self.partition.index() as u8)?;
        writer.write_i32::<LittleEndian>(self.extra_erosion)?;
        writer.write_u8(self.median_filter as u8)?;

        match &self.geometry {
            Some(geom) => {
                writer.write_u8(1)?;
                write_count(writer, geom.verts().len(), "vertices")?;
                for &v in geom.verts() {
                    write_vec3(writer, v)?;
                }
                write_count(writer, geom.tris().len(), "triangles")?;
                for tri in geom.tris() {
                    for &i in tri {
                        writer.write_u32::<LittleEndian>(i)?;
                    }
                }
            }
            None => writer.write_u8(0)?,
        }

        write_count(writer, self.volumes.len(), "convex volumes")?;
        for vol in self.volumes.all() {
            write_count(writer, vol.verts.len(), "volume vertices")?;
            for &v in &vol.verts {
                write_vec3(writer, v)?;
            }
            writer.write_f32::<LittleEndian>(vol.hmin)?;
            writer.write_f32::<LittleEndian>(vol.hmax)?;
            writer.write_u8(vol.area)?;
        }

        write_count(writer, self.off_mesh.len(), "off-mesh connections")?;
        for con in self.off_mesh.all() {
            write_vec3(writer, con.start)?;
            write_vec3(writer, con.end)?;
            writer.write_f32::<LittleEndian>(con.radius)?;
            writer.write_u8(con.bidirectional as u8)?;
            writer.write_u8(con.area)?;
            writer.write_u16::<LittleEndian>(con.flags.bits())?;
            writer.write_u32::<LittleEndian>(con.user_id)?;
        }

        self.nav_mesh.write_to(writer)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Serialization(format!(
                "invalid snapshot magic {magic:#010x}"
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported snapshot version {version} (expected {SNAPSHOT_VERSION})"
            )));
        }

        let mut settings = BuildSettings::default();
        for key in BuildSettings::KEYS {
            settings.set(key, reader.read_f32::<LittleEndian>()?)?;
        }
        let settings = settings.sanitized().map_err(corrupt)?;
        let partition = PartitionType::from_index(reader.read_u8()? as i32).map_err(corrupt)?;
        let extra_erosion = reader.read_i32::<LittleEndian>()?;
        let median_filter = reader.read_u8()? != 0;

        let geometry = match reader.read_u8()? {
            0 => None,
            _ => {
                let nverts = reader.read_u32::<LittleEndian>()?;
                let verts = read_items(reader, nverts, read_vec3)?;
                let ntris = reader.read_u32::<LittleEndian>()?;
                let tris = read_items(reader, ntris, |r| {
                    Ok([
                        r.read_u32::<LittleEndian>()?,
                        r.read_u32::<LittleEndian>()?,
                        r.read_u32::<LittleEndian>()?,
                    ])
                })?;
                Some(InputGeometry::from_triangles(verts, tris).map_err(corrupt)?)
            }
        };

        let mut volumes = ConvexVolumeSet::new();
        let nvolumes = reader.read_u32::<LittleEndian>()?;
        for _ in 0..nvolumes {
            let nverts = reader.read_u32::<LittleEndian>()?;
            let verts = read_items(reader, nverts, read_vec3)?;
            let hmin = reader.read_f32::<LittleEndian>()?;
            let hmax = reader.read_f32::<LittleEndian>()?;
            let area = reader.read_u8()?;
            let volume = ConvexVolume::new(verts, hmin, hmax, area).map_err(corrupt)?;
            volumes.add(volume).map_err(corrupt)?;
        }

        let mut off_mesh = OffMeshConnectionSet::new();
        let ncons = reader.read_u32::<LittleEndian>()?;
        for _ in 0..ncons {
            let start = read_vec3(reader)?;
            let end = read_vec3(reader)?;
            let radius = reader.read_f32::<LittleEndian>()?;
            let bidirectional = reader.read_u8()? != 0;
            let area = reader.read_u8()?;
            let flags = PolyFlags::from_bits_retain(reader.read_u16::<LittleEndian>()?);
            let user_id = reader.read_u32::<LittleEndian>()?;
            let mut con = OffMeshConnection::new(start, end, radius, bidirectional, area, flags)
                .map_err(corrupt)?;
            con.user_id = user_id;
            off_mesh.add(con).map_err(corrupt)?;
        }

        let nav_mesh = Arc::new(NavMesh::read_from(reader)?);

        Ok(Self {
            settings,
            partition,
            extra_erosion,
            median_filter,
            geometry,
            volumes,
            off_mesh,
            nav_mesh,
        })
    }
}

fn corrupt(e: Error) -> Error {
    Error::Serialization(format!("corrupt snapshot: {e}"))
}

fn write_count<W: Write>(writer: &mut W, len: usize, what: &str) -> Result<()> {
    let count =
        u32::try_from(len).map_err(|_| Error::Serialization(format!("too many {what} ({len})")))?;
    writer.write_u32::<LittleEndian>(count)?;
    Ok(())
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
