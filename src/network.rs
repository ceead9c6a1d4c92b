//! Control networks: 3D tie points and ground control points together with their pixel
//! observations.

use byteorder::{BigEndian, WriteBytesExt};
use cgmath::{Point2, Point3};
use disjoint_sets::UnionFind;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_while1};
use nom::character::complete::{char, space0};
use nom::combinator::{eof, map, rest};
use nom::multi::count;
use nom::number::complete::{be_f64, be_u64, be_u8};
use nom::sequence::{delimited, preceded, separated_pair, tuple};
use nom::IResult;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{extension_of, Error, Result};

/// Classification of a control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointKind {
    /// Position only known from triangulation; free to move.
    Tie,
    /// Externally surveyed position that resists adjustment.
    GroundControl,
}

/// A pixel measurement of a control point in one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Index of the observing camera in the camera set.
    pub camera: usize,
    pub pixel: Point2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    pub position: Point3<f64>,
    pub kind: ControlPointKind,
    pub observations: Vec<Observation>,
}

impl ControlPoint {
    pub fn new(position: Point3<f64>, kind: ControlPointKind) -> Self {
        ControlPoint {
            position,
            kind,
            observations: Vec::new(),
        }
    }

    pub fn is_ground_control(&self) -> bool {
        self.kind == ControlPointKind::GroundControl
    }

    pub fn observe(&mut self, camera: usize, pixel: Point2<f64>) {
        self.observations.push(Observation { camera, pixel })
    }
}

/// Collection of control points. Point order defines the point indices used everywhere else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlNetwork {
    pub points: Vec<ControlPoint>,
}

impl ControlNetwork {
    pub fn new(points: Vec<ControlPoint>) -> Self {
        ControlNetwork { points }
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Total number of pixel observations over all points.
    pub fn num_observations(&self) -> usize {
        self.points.iter().map(|p| p.observations.len()).sum()
    }

    pub fn num_ground_control_points(&self) -> usize {
        self.points.iter().filter(|p| p.is_ground_control()).count()
    }

    /// Largest camera index referenced by any observation plus one.
    pub fn num_referenced_cameras(&self) -> usize {
        self.points
            .iter()
            .flat_map(|p| p.observations.iter())
            .map(|o| o.camera + 1)
            .max()
            .unwrap_or(0)
    }

    /// Number of connected components of the camera-point graph, ignoring points without
    /// observations and cameras that see nothing.
    pub fn num_components(&self, num_cameras: usize) -> usize {
        let mut uf = UnionFind::new(num_cameras + self.num_points());
        let mut used = HashSet::new();
        for (i, point) in self.points.iter().enumerate() {
            for obs in point.observations.iter().filter(|o| o.camera < num_cameras) {
                let p = num_cameras + i;
                used.insert(obs.camera);
                used.insert(p);
                if !uf.equiv(obs.camera, p) {
                    uf.union(obs.camera, p);
                }
            }
        }
        used.iter().map(|x| uf.find(*x)).collect::<HashSet<_>>().len()
    }

    /// Load a control network. `.cnet` files are binary, `.net` files are text.
    pub fn from_file(path: &Path) -> Result<Self> {
        match extension_of(path)?.as_str() {
            "cnet" => Self::from_file_binary(path),
            "net" => Self::from_file_text(path),
            ext => Err(Error::Configuration(format!(
                "unknown control network file extension {} ({})",
                ext,
                path.display()
            ))),
        }
    }

    /// Write a control network, choosing the format from the extension like [from_file].
    pub fn write(&self, path: &Path) -> Result<()> {
        match extension_of(path)?.as_str() {
            "cnet" => self.write_binary(path),
            "net" => self.write_text(path),
            ext => Err(Error::Configuration(format!(
                "unknown control network file extension {} ({})",
                ext,
                path.display()
            ))),
        }
    }

    /// Parse the big endian binary format:
    ///
    /// ```txt
    /// <num_points: u64>
    /// repeated num_points times:
    ///   <kind: u8, 0 = tie, 1 = ground control> <x: f64> <y: f64> <z: f64>
    ///   <num_observations: u64>
    ///   repeated num_observations times:
    ///     <camera: u64> <u: f64> <v: f64>
    /// ```
    pub fn from_file_binary(path: &Path) -> Result<Self> {
        fn observation(input: &[u8]) -> IResult<&[u8], Observation> {
            let (input, (camera, u, v)) = tuple((be_u64, be_f64, be_f64))(input)?;
            Ok((
                input,
                Observation {
                    camera: camera as usize,
                    pixel: Point2::new(u, v),
                },
            ))
        }

        fn control_point(input: &[u8]) -> IResult<&[u8], ControlPoint> {
            let (input, kind) = be_u8(input)?;
            let (input, (x, y, z)) = tuple((be_f64, be_f64, be_f64))(input)?;
            let (input, num_obs) = be_u64(input)?;
            let (input, observations) = count(observation, num_obs as usize)(input)?;
            let kind = if kind == 1 {
                ControlPointKind::GroundControl
            } else {
                ControlPointKind::Tie
            };
            Ok((
                input,
                ControlPoint {
                    position: Point3::new(x, y, z),
                    kind,
                    observations,
                },
            ))
        }

        let mut contents = Vec::new();
        File::open(path)?.read_to_end(&mut contents)?;

        let (_, num_points) = be_u64::<_, nom::error::Error<&[u8]>>(contents.as_slice())
            .map_err(|_| Error::Parse(format!("{}: missing header", path.display())))?;
        let (rest, points) = count(control_point, num_points as usize)(&contents[8..])
            .map_err(|_| Error::Parse(format!("{}: truncated control network", path.display())))?;
        if !rest.is_empty() {
            return Err(Error::Parse(format!(
                "{}: {} trailing bytes",
                path.display(),
                rest.len()
            )));
        }
        Ok(ControlNetwork { points })
    }

    pub fn write_binary(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u64::<BigEndian>(self.points.len() as u64)?;
        for point in &self.points {
            file.write_u8(if point.is_ground_control() { 1 } else { 0 })?;
            file.write_f64::<BigEndian>(point.position.x)?;
            file.write_f64::<BigEndian>(point.position.y)?;
            file.write_f64::<BigEndian>(point.position.z)?;
            file.write_u64::<BigEndian>(point.observations.len() as u64)?;
            for obs in &point.observations {
                file.write_u64::<BigEndian>(obs.camera as u64)?;
                file.write_f64::<BigEndian>(obs.pixel.x)?;
                file.write_f64::<BigEndian>(obs.pixel.y)?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Parse the PVL style text format:
    ///
    /// ```txt
    /// Object = ControlNetwork
    ///   Object = ControlPoint
    ///     PointType = Ground
    ///     X = 10.0
    ///     Y = 20.0
    ///     Z = 0.5
    ///     Group = ControlMeasure
    ///       Camera = 0
    ///       Sample = 512.25
    ///       Line = 300.5
    ///     End_Group
    ///   End_Object
    /// End_Object
    /// End
    /// ```
    /// `PointType` is `Tie` or `Ground`. Unknown keywords are ignored.
    pub fn from_file_text(path: &Path) -> Result<Self> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let tree = parse_pvl(&contents)
            .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?;

        let network = tree
            .children
            .iter()
            .find(|x| x.name == "ControlNetwork")
            .ok_or_else(|| {
                Error::Parse(format!("{}: no ControlNetwork object", path.display()))
            })?;

        let points = network
            .children
            .iter()
            .filter(|x| x.name == "ControlPoint")
            .map(|x| control_point_from_pvl(x))
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?;
        Ok(ControlNetwork { points })
    }

    pub fn write_text(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(file, "Object = ControlNetwork")?;
        for point in &self.points {
            writeln!(file, "  Object = ControlPoint")?;
            let kind = match point.kind {
                ControlPointKind::Tie => "Tie",
                ControlPointKind::GroundControl => "Ground",
            };
            writeln!(file, "    PointType = {}", kind)?;
            writeln!(file, "    X = {}", point.position.x)?;
            writeln!(file, "    Y = {}", point.position.y)?;
            writeln!(file, "    Z = {}", point.position.z)?;
            for obs in &point.observations {
                writeln!(file, "    Group = ControlMeasure")?;
                writeln!(file, "      Camera = {}", obs.camera)?;
                writeln!(file, "      Sample = {}", obs.pixel.x)?;
                writeln!(file, "      Line = {}", obs.pixel.y)?;
                writeln!(file, "    End_Group")?;
            }
            writeln!(file, "  End_Object")?;
        }
        writeln!(file, "End_Object")?;
        writeln!(file, "End")?;
        file.flush()?;
        Ok(())
    }
}

impl std::fmt::Display for ControlNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Control network with {} points ({} ground control) and {} observations",
            self.num_points(),
            self.num_ground_control_points(),
            self.num_observations()
        )
    }
}

/// Node of a parsed PVL document. `Object` and `Group` blocks are both nodes.
#[derive(Debug, Default)]
struct PvlNode {
    name: String,
    keywords: Vec<(String, String)>,
    children: Vec<PvlNode>,
}

impl PvlNode {
    fn keyword(&self, key: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

enum PvlLine<'a> {
    Begin(&'a str),
    EndBlock,
    End,
    Assign(&'a str, &'a str),
}

fn pvl_line(input: &str) -> IResult<&str, PvlLine<'_>> {
    let key = || take_while1(|c: char| c.is_alphanumeric() || c == '_');
    let value = || {
        map(preceded(space0, take_till(|c: char| c == '#')), |x: &str| {
            x.trim()
        })
    };
    let assignment = separated_pair(key(), delimited(space0, char('='), space0), value());
    delimited(
        space0,
        alt((
            map(
                preceded(alt((tag("End_Object"), tag("End_Group"))), rest),
                |_| PvlLine::EndBlock,
            ),
            map(tuple((tag("End"), eof)), |_| PvlLine::End),
            map(assignment, |(k, v): (&str, &str)| {
                if k == "Object" || k == "Group" {
                    PvlLine::Begin(v)
                } else {
                    PvlLine::Assign(k, v)
                }
            }),
        )),
        space0,
    )(input)
}

fn parse_pvl(contents: &str) -> std::result::Result<PvlNode, String> {
    let mut stack = vec![PvlNode::default()];
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (_, parsed) =
            pvl_line(line).map_err(|_| format!("line {}: cannot parse \"{}\"", lineno + 1, line))?;
        match parsed {
            PvlLine::Begin(name) => stack.push(PvlNode {
                name: name.to_string(),
                ..PvlNode::default()
            }),
            PvlLine::EndBlock => {
                if stack.len() < 2 {
                    return Err(format!("line {}: unmatched {}", lineno + 1, line));
                }
                if let Some(node) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
            }
            PvlLine::End => break,
            PvlLine::Assign(k, v) => {
                if let Some(node) = stack.last_mut() {
                    node.keywords.push((k.to_string(), v.to_string()));
                }
            }
        }
    }
    if stack.len() != 1 {
        return Err(format!("{} unterminated block(s)", stack.len() - 1));
    }
    stack.pop().ok_or_else(|| "empty document".to_string())
}

fn control_point_from_pvl(node: &PvlNode) -> std::result::Result<ControlPoint, String> {
    fn number<T: std::str::FromStr>(node: &PvlNode, key: &str) -> std::result::Result<T, String> {
        node.keyword(key)
            .ok_or_else(|| format!("{} is missing {}", node.name, key))?
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid {}", node.name, key))
    }

    let kind = match node.keyword("PointType") {
        Some(x) if x.eq_ignore_ascii_case("ground") => ControlPointKind::GroundControl,
        Some(x) if x.eq_ignore_ascii_case("tie") => ControlPointKind::Tie,
        None => ControlPointKind::Tie,
        Some(x) => return Err(format!("unknown PointType {}", x)),
    };
    let mut point = ControlPoint::new(
        Point3::new(number(node, "X")?, number(node, "Y")?, number(node, "Z")?),
        kind,
    );
    for measure in node.children.iter().filter(|x| x.name == "ControlMeasure") {
        point.observe(
            number(measure, "Camera")?,
            Point2::new(number(measure, "Sample")?, number(measure, "Line")?),
        );
    }
    Ok(point)
}
