//! Object naming and formatting helpers

/// Name of the object holding the metadata document of a dataset
pub const METADATA_OBJECT_NAME: &str = "metadata.json";

/// Object name of `chunk` within the layer called `layer_name`
pub fn chunk_object_name(layer_name: &str, chunk: u64) -> String {
    format!("{}/{}", layer_name, chunk)
}

/// Human readable byte count using binary units, e.g. `1.50 KB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut scaled = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for &next in &UNITS[1..] {
        if scaled < 1024.0 {
            break;
        }
        scaled /= 1024.0;
        unit = next;
    }
    format!("{scaled:.2} {unit}")
}
