//! Navigation waypoint graph, stored per map as `waypoints_graph.csv` with
//! columns `id,x,y,z,neighbors` (neighbors `;`-separated).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub position: [f64; 3],
    pub neighbors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WaypointRow {
    id: String,
    x: f64,
    y: f64,
    z: f64,
    #[serde(default)]
    neighbors: String,
}

pub fn read_waypoints_csv(path: &Path) -> Result<Vec<Waypoint>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut out = Vec::new();
    for (idx, row) in rdr.deserialize::<WaypointRow>().enumerate() {
        let row = row.map_err(|e| Error::MalformedWaypointRow {
            row: idx + 1,
            reason: e.to_string(),
        })?;
        let neighbors = row
            .neighbors
            .split(';')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        out.push(Waypoint {
            name: row.id,
            position: [row.x, row.y, row.z],
            neighbors,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_graph_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("waypoints_graph.csv");
        std::fs::write(
            &path,
            "id,x,y,z,neighbors\nentrance,0.0,0.0,1.5,hall\nhall,3.0,0.0,1.5,entrance;desk\ndesk,6.5,0.0,1.5,\n",
        )
        .unwrap();
        let wps = read_waypoints_csv(&path).unwrap();
        assert_eq!(wps.len(), 3);
        assert_eq!(wps[1].name, "hall");
        assert_eq!(wps[1].neighbors, vec!["entrance", "desk"]);
        assert!(wps[2].neighbors.is_empty());
        assert_eq!(wps[2].position, [6.5, 0.0, 1.5]);
    }
}
