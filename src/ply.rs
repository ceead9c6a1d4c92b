//! Export of cameras and control networks to `.ply` for visualization.

use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Ply, Property, PropertyDef, PropertyType, ScalarType,
};
use ply_rs::writer::Writer;
use tracing::debug;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::camera::Camera;
use crate::error::Result;
use crate::network::ControlNetwork;

const CAMERA_COLOR: [u8; 3] = [255, 0, 0];
const TIE_COLOR: [u8; 3] = [0, 255, 0];
const GROUND_CONTROL_COLOR: [u8; 3] = [0, 0, 255];

fn vertex(p: [f64; 3], color: [u8; 3]) -> DefaultElement {
    let mut v = DefaultElement::new();
    v.insert("x".to_string(), Property::Float(p[0] as f32));
    v.insert("y".to_string(), Property::Float(p[1] as f32));
    v.insert("z".to_string(), Property::Float(p[2] as f32));
    v.insert("red".to_string(), Property::UChar(color[0]));
    v.insert("green".to_string(), Property::UChar(color[1]));
    v.insert("blue".to_string(), Property::UChar(color[2]));
    v
}

fn header() -> Ply<DefaultElement> {
    let mut ply = Ply::<DefaultElement>::new();
    let mut point_element = ElementDef::new("vertex".to_string());
    for name in &["x", "y", "z"] {
        point_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Float),
        ));
    }
    for name in &["red", "green", "blue"] {
        point_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(point_element);
    let mut edge_element = ElementDef::new("edge".to_string());
    edge_element.properties.add(PropertyDef::new(
        "vertex1".to_string(),
        PropertyType::Scalar(ScalarType::Int),
    ));
    edge_element.properties.add(PropertyDef::new(
        "vertex2".to_string(),
        PropertyType::Scalar(ScalarType::Int),
    ));
    ply.header.elements.add(edge_element);
    ply
}

/// Write camera centers, control points and one edge per observation to `out`. Cameras are red,
/// tie points green and ground control points blue. Vertices are the cameras followed by the
/// points, in order.
pub fn write_ply_to<C: Camera, W: Write>(
    out: &mut W,
    cameras: &[C],
    network: &ControlNetwork,
) -> Result<()> {
    let mut ply = header();

    let mut vertices = cameras
        .iter()
        .map(|camera| {
            let c = camera.center();
            vertex([c.x, c.y, c.z], CAMERA_COLOR)
        })
        .collect::<Vec<_>>();
    vertices.extend(network.points.iter().map(|point| {
        let color = if point.is_ground_control() {
            GROUND_CONTROL_COLOR
        } else {
            TIE_COLOR
        };
        let p = point.position;
        vertex([p.x, p.y, p.z], color)
    }));
    ply.payload.insert("vertex".to_string(), vertices);

    let edges = network
        .points
        .iter()
        .enumerate()
        .flat_map(|(i, point)| {
            point.observations.iter().map(move |obs| {
                let mut e = DefaultElement::new();
                e.insert("vertex1".to_string(), Property::Int(obs.camera as i32));
                e.insert(
                    "vertex2".to_string(),
                    Property::Int((i + cameras.len()) as i32),
                );
                e
            })
        })
        .collect();
    ply.payload.insert("edge".to_string(), edges);

    let writer = Writer::new();
    writer.write_ply(out, &mut ply)?;
    Ok(())
}

/// Write a `.ply` file, see [write_ply_to].
pub fn write_ply<C: Camera>(path: &Path, cameras: &[C], network: &ControlNetwork) -> Result<()> {
    debug!("writing {}", path.display());
    let mut file = BufWriter::new(File::create(path)?);
    write_ply_to(&mut file, cameras, network)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{synthetic_rig, RigOptions};

    #[test]
    fn header_counts_and_colors() {
        let scene = synthetic_rig(&RigOptions {
            num_points: 20,
            ..Default::default()
        });
        let mut buf = Vec::new();
        write_ply_to(&mut buf, &scene.cameras, &scene.network).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("ply"));
        assert!(text.contains(&format!(
            "element vertex {}",
            scene.cameras.len() + scene.network.num_points()
        )));
        assert!(text.contains(&format!(
            "element edge {}",
            scene.network.num_observations()
        )));
        assert!(text.contains(" 255 0 0"));
        assert!(text.contains(" 0 255 0"));
        assert!(text.contains(" 0 0 255"));
    }
}
