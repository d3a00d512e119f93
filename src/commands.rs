//! CLI surface and the pure parsing helpers behind it.

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;

use crate::api::types::Plant;

pub const MONTHS: [&str; 12] = [
  "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Display name for plants without a location; not stored anywhere.
pub const DEFAULT_LOCATION: &str = "Unsorted";

#[derive(Parser, Debug)]
#[command(name = "verdant")]
#[command(about = "An offline-first plant care tracker")]
#[command(version)]
pub struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/verdant/config.yaml)
  #[arg(short, long)]
  pub config: Option<PathBuf>,

  /// Backend base URL, overriding config and VERDANT_SERVER
  #[arg(long)]
  pub server: Option<String>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// List plants
  List {
    /// Only plants at this location
    #[arg(short, long)]
    location: Option<String>,
  },

  /// Show one plant with its monthly care bands
  Show {
    name: String,
    /// Write the plant image to this file
    #[arg(long)]
    image_out: Option<PathBuf>,
  },

  /// Create a plant
  Add {
    name: String,
    #[command(flatten)]
    opts: PlantOpts,
  },

  /// Update fields of a plant
  Set {
    name: String,
    #[command(flatten)]
    opts: PlantOpts,
  },

  /// Archive a plant (soft delete; history is pruned)
  Archive { name: String },

  /// Delete a plant permanently
  Delete { name: String },

  /// Record a watering
  Water { name: String },

  /// Record a feeding
  Feed { name: String },

  /// Undo the last watering or feeding
  Undo {
    kind: ActionKind,
    name: String,
    /// Restore this previous time instead of clearing the entry
    #[arg(long, value_name = "ISO8601")]
    to: Option<String>,
  },

  /// List or edit locations
  Locations {
    #[command(subcommand)]
    action: Option<LocationsCommand>,
  },

  /// Flush queued mutations and pull remote changes
  Sync {
    /// Keep running: probe connectivity, sync on reconnect and on an interval
    #[arg(long)]
    watch: bool,
  },

  /// Show connectivity, pending mutations and last sync
  Status,

  /// Inspect queued offline mutations
  Outbox {
    /// Discard every queued mutation
    #[arg(long)]
    clear: bool,
  },
}

#[derive(Subcommand, Debug)]
pub enum LocationsCommand {
  /// Add a location
  Add { name: String },
  /// Remove a location (the server reassigns its plants)
  Remove { name: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ActionKind {
  Water,
  Feed,
}

/// Plant fields shared by `add` and `set`. Month bands are comma-separated
/// day intervals with empty slots for "no care this month", e.g. "7,7,,,,3".
#[derive(Args, Debug, Default)]
pub struct PlantOpts {
  #[arg(short, long)]
  pub description: Option<String>,

  #[arg(short, long)]
  pub location: Option<String>,

  /// Image reference by server path, e.g. "images/ficus.png"
  #[arg(long)]
  pub image: Option<String>,

  #[arg(long, value_name = "CSV")]
  pub watering_min: Option<String>,

  #[arg(long, value_name = "CSV")]
  pub watering_max: Option<String>,

  #[arg(long, value_name = "CSV")]
  pub feeding_min: Option<String>,

  #[arg(long, value_name = "CSV")]
  pub feeding_max: Option<String>,
}

impl PlantOpts {
  /// Fill a new plant from the set flags.
  pub fn apply_to(&self, plant: &mut Plant) -> Result<()> {
    if let Some(description) = &self.description {
      plant.description = description.clone();
    }
    if let Some(location) = &self.location {
      plant.location = Some(location.clone());
    }
    if let Some(image) = &self.image {
      plant.image = Some(image.clone());
    }
    if let Some(csv) = &self.watering_min {
      plant.watering_min = parse_months(csv)?;
    }
    if let Some(csv) = &self.watering_max {
      plant.watering_max = parse_months(csv)?;
    }
    if let Some(csv) = &self.feeding_min {
      plant.feeding_min = parse_months(csv)?;
    }
    if let Some(csv) = &self.feeding_max {
      plant.feeding_max = parse_months(csv)?;
    }
    Ok(())
  }

  /// Build the partial-update body (camelCase wire names) from the set
  /// flags only.
  pub fn to_patch(&self) -> Result<Value> {
    let mut patch = serde_json::Map::new();
    if let Some(description) = &self.description {
      patch.insert("description".to_string(), Value::String(description.clone()));
    }
    if let Some(location) = &self.location {
      patch.insert("location".to_string(), Value::String(location.clone()));
    }
    if let Some(image) = &self.image {
      patch.insert("image".to_string(), Value::String(image.clone()));
    }
    if let Some(csv) = &self.watering_min {
      patch.insert("wateringMin".to_string(), months_value(csv)?);
    }
    if let Some(csv) = &self.watering_max {
      patch.insert("wateringMax".to_string(), months_value(csv)?);
    }
    if let Some(csv) = &self.feeding_min {
      patch.insert("feedingMin".to_string(), months_value(csv)?);
    }
    if let Some(csv) = &self.feeding_max {
      patch.insert("feedingMax".to_string(), months_value(csv)?);
    }
    Ok(Value::Object(patch))
  }
}

fn months_value(csv: &str) -> Result<Value> {
  Ok(serde_json::to_value(parse_months(csv)?)?)
}

/// Parse a comma-separated month band into 12 slots. Empty slots and a
/// short list pad out with "no care".
pub fn parse_months(input: &str) -> Result<Vec<Option<u32>>> {
  let parts: Vec<&str> = input.split(',').collect();
  if parts.len() > 12 {
    return Err(eyre!("At most 12 month values, got {}", parts.len()));
  }

  let mut months = Vec::with_capacity(12);
  for part in parts {
    let trimmed = part.trim();
    if trimmed.is_empty() {
      months.push(None);
    } else {
      let days: u32 = trimmed
        .parse()
        .map_err(|e| eyre!("Invalid month value {:?}: {}", trimmed, e))?;
      months.push(Some(days));
    }
  }
  months.resize(12, None);
  Ok(months)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_months_pads_to_twelve() {
    let months = parse_months("7,7,5").unwrap();
    assert_eq!(months.len(), 12);
    assert_eq!(months[0], Some(7));
    assert_eq!(months[2], Some(5));
    assert_eq!(months[3], None);
  }

  #[test]
  fn test_parse_months_empty_slots() {
    let months = parse_months("7,,5,").unwrap();
    assert_eq!(months[0], Some(7));
    assert_eq!(months[1], None);
    assert_eq!(months[2], Some(5));
  }

  #[test]
  fn test_parse_months_rejects_garbage_and_overflow() {
    assert!(parse_months("seven").is_err());
    assert!(parse_months("1,2,3,4,5,6,7,8,9,10,11,12,13").is_err());
  }

  #[test]
  fn test_patch_only_includes_set_flags() {
    let opts = PlantOpts {
      location: Some("Salon".to_string()),
      watering_min: Some("7".to_string()),
      ..PlantOpts::default()
    };
    let patch = opts.to_patch().unwrap();
    let obj = patch.as_object().unwrap();
    assert_eq!(obj.len(), 2);
    assert_eq!(obj["location"], "Salon");
    assert_eq!(obj["wateringMin"][0], 7);
    assert!(!obj.contains_key("description"));
  }
}
