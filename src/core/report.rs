//! HTML indexes linking to the saved montages.

use super::{
    activation::ClassWeights,
    error::{Error, Result},
    montage::montage_file_name,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// Writes `<layer>.html` with one entry per unit.
pub fn write_layer_index(dir: &Path, layer: &str, num_units: usize, cropped: bool) -> Result<PathBuf> {
    let lines: Vec<String> = (0..num_units)
        .map(|unit| {
            format!(
                "<p>unit{unit:03}<br><img src=\"image/{}\"></p>",
                montage_file_name(layer, unit, cropped)
            )
        })
        .collect();

    let path = dir.join(format!("{layer}.html"));
    fs::write(&path, lines.join("\n"))?;
    info!(?path, "wrote layer index");
    Ok(path)
}

/// Reads a category list, one class per line. A line like `/a/abbey 0` yields
/// `abbey`: trailing fields are dropped and so is a leading `/x/` prefix.
pub fn read_labels(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => Error::MissingResource {
            path: path.to_path_buf(),
        },
        _ => Error::Io(err),
    })?;

    Ok(text
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| {
            name.strip_prefix('/')
                .and_then(|rest| rest.split_once('/'))
                .map_or(name, |(_, label)| label)
                .to_string()
        })
        .collect())
}

/// Writes `<layer>-classes.html`: for every class, the `top_n` units with the
/// largest weight in the classifier's final layer, with their montages.
pub fn write_class_index(
    dir: &Path,
    layer: &str,
    labels_file: &Path,
    weights: Option<&ClassWeights>,
    top_n: usize,
    cropped: bool,
) -> Result<PathBuf> {
    let labels = read_labels(labels_file)?;
    let weights = weights.ok_or_else(|| Error::MissingResource {
        path: PathBuf::from(format!("{layer}: class weights")),
    })?;

    if labels.len() != weights.classes {
        return Err(Error::InvalidShape {
            expected: format!("{} class labels", weights.classes),
            got: format!("{} labels in {:?}", labels.len(), labels_file),
        });
    }

    let mut html = Vec::new();
    for (class, label) in labels.iter().enumerate() {
        html.push(format!("<h3>{label}</h3>"));
        for unit in weights.top_units(class, top_n) {
            html.push(format!(
                "<p>unit{unit:03} ({:.3})<br><img src=\"image/{}\"></p>",
                weights.row(class)[unit],
                montage_file_name(layer, unit, cropped)
            ));
        }
    }

    let path = dir.join(format!("{layer}-classes.html"));
    fs::write(&path, html.join("\n"))?;
    info!(?path, "wrote class index");
    Ok(path)
}
