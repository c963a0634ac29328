//! Rating tables, dataset registration, and the delimited file formats
//! connecting the pipeline stages.
//!
//! Matrix, train, and test files are tab-separated without a header, in
//! the fixed column order `user, item, rating[, timestamp]`. Per-model
//! result files do carry a header (`user item prediction` for predictors,
//! `rank user item score` for recommenders, plus a trailing `rating`
//! column once the original ratings have been merged back in).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::{ItemId, Rating, Timestamp, UserId};

/// One user-item interaction.
#[derive(Clone, Debug, PartialEq)]
pub struct RatingRow {
    /// User identifier.
    pub user: UserId,
    /// Item identifier.
    pub item: ItemId,
    /// Rating value.
    pub rating: Rating,
    /// Interaction timestamp, when the matrix declares one.
    pub timestamp: Option<Timestamp>,
}

/// An in-memory user-item-rating table.
#[derive(Clone, Debug, Default)]
pub struct RatingTable {
    rows: Vec<RatingRow>,
}

impl RatingTable {
    /// Creates an empty table.
    pub fn new() -> RatingTable {
        RatingTable { rows: Vec::new() }
    }

    /// The rows in table order.
    pub fn rows(&self) -> &[RatingRow] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a row.
    pub fn push(&mut self, row: RatingRow) {
        self.rows.push(row);
    }

    /// Appends all rows of another table.
    pub fn extend(&mut self, other: RatingTable) {
        self.rows.extend(other.rows);
    }

    /// The distinct users, sorted.
    pub fn unique_users(&self) -> Vec<UserId> {
        self.rows.iter().map(|row| row.user).unique().sorted().collect()
    }

    /// The distinct items, sorted.
    pub fn unique_items(&self) -> Vec<ItemId> {
        self.rows.iter().map(|row| row.item).unique().sorted().collect()
    }

    /// Rating lookup keyed by `(user, item)`; later rows win on duplicates.
    pub fn rating_map(&self) -> HashMap<(UserId, ItemId), Rating> {
        self.rows
            .iter()
            .map(|row| ((row.user, row.item), row.rating))
            .collect()
    }

    /// The items each user has interacted with.
    pub fn items_by_user(&self) -> HashMap<UserId, HashSet<ItemId>> {
        let mut map: HashMap<UserId, HashSet<ItemId>> = HashMap::new();
        for row in &self.rows {
            map.entry(row.user).or_insert_with(HashSet::new).insert(row.item);
        }
        map
    }
}

impl From<Vec<RatingRow>> for RatingTable {
    fn from(rows: Vec<RatingRow>) -> RatingTable {
        RatingTable { rows }
    }
}

impl IntoIterator for RatingTable {
    type Item = RatingRow;
    type IntoIter = std::vec::IntoIter<RatingRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Reads a headerless tab-separated matrix file.
pub fn read_matrix(path: &Path, has_timestamp: bool) -> Result<RatingTable, CoreError> {
    if !path.exists() {
        return Err(CoreError::Resource(format!(
            "matrix file '{}' does not exist",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut table = RatingTable::new();
    for record in reader.records() {
        let record = record?;
        let user = parse_field::<UserId>(&record, 0, path)?;
        let item = parse_field::<ItemId>(&record, 1, path)?;
        let rating = parse_field::<Rating>(&record, 2, path)?;
        let timestamp = if has_timestamp {
            Some(parse_field::<Timestamp>(&record, 3, path)?)
        } else {
            None
        };

        table.push(RatingRow {
            user,
            item,
            rating,
            timestamp,
        });
    }

    Ok(table)
}

/// Writes a table as a headerless tab-separated file. Only the three
/// canonical columns are kept unless `with_timestamp` is set.
pub fn write_matrix(
    path: &Path,
    table: &RatingTable,
    with_timestamp: bool,
) -> Result<(), CoreError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;

    for row in table.rows() {
        if with_timestamp {
            let timestamp = row.timestamp.ok_or_else(|| {
                CoreError::Logic(format!(
                    "row ({}, {}) has no timestamp for '{}'",
                    row.user,
                    row.item,
                    path.display()
                ))
            })?;
            writer.write_record(&[
                row.user.to_string(),
                row.item.to_string(),
                row.rating.to_string(),
                timestamp.to_string(),
            ])?;
        } else {
            writer.write_record(&[
                row.user.to_string(),
                row.item.to_string(),
                row.rating.to_string(),
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn parse_field<T: std::str::FromStr>(
    record: &csv::StringRecord,
    index: usize,
    path: &Path,
) -> Result<T, CoreError> {
    let field = record.get(index).ok_or_else(|| {
        CoreError::Logic(format!(
            "missing column {} in '{}'",
            index,
            path.display()
        ))
    })?;

    field.parse::<T>().map_err(|_| {
        CoreError::Logic(format!(
            "malformed value '{}' in '{}'",
            field,
            path.display()
        ))
    })
}

/// One row of a per-model result file.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRow {
    /// Recommendation rank, absent for predictor output.
    pub rank: Option<u64>,
    /// User identifier.
    pub user: UserId,
    /// Item identifier.
    pub item: ItemId,
    /// Predicted rating or recommendation score.
    pub score: f64,
    /// Ground-truth rating merged in by rating reconstruction.
    pub rating: Option<Rating>,
}

/// Reads a per-model result file, mapping its header columns.
pub fn read_results(path: &Path) -> Result<Vec<ResultRow>, CoreError> {
    if !path.exists() {
        return Err(CoreError::Resource(format!(
            "result file '{}' does not exist",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|header| header == name);

    let rank_idx = column("rank");
    let user_idx = column("user")
        .ok_or_else(|| CoreError::Logic(format!("no 'user' column in '{}'", path.display())))?;
    let item_idx = column("item")
        .ok_or_else(|| CoreError::Logic(format!("no 'item' column in '{}'", path.display())))?;
    let score_idx = column("prediction").or_else(|| column("score")).ok_or_else(|| {
        CoreError::Logic(format!(
            "no 'prediction' or 'score' column in '{}'",
            path.display()
        ))
    })?;
    let rating_idx = column("rating");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;

        let rank = match rank_idx {
            Some(index) => Some(parse_field::<u64>(&record, index, path)?),
            None => None,
        };
        let rating = match rating_idx {
            Some(index) => match record.get(index) {
                Some("") | None => None,
                Some(field) => Some(field.parse::<Rating>().map_err(|_| {
                    CoreError::Logic(format!(
                        "malformed rating '{}' in '{}'",
                        field,
                        path.display()
                    ))
                })?),
            },
            None => None,
        };

        rows.push(ResultRow {
            rank,
            user: parse_field(&record, user_idx, path)?,
            item: parse_field(&record, item_idx, path)?,
            score: parse_field(&record, score_idx, path)?,
            rating,
        });
    }

    Ok(rows)
}

/// Rewrites a result file with the ground-truth `rating` column appended.
pub fn write_results_with_ratings(path: &Path, rows: &[ResultRow]) -> Result<(), CoreError> {
    let ranked = rows.first().map_or(false, |row| row.rank.is_some());

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;

    if ranked {
        writer.write_record(&["rank", "user", "item", "score", "rating"])?;
    } else {
        writer.write_record(&["user", "item", "prediction", "rating"])?;
    }

    for row in rows {
        let rating = row.rating.map(|value| value.to_string()).unwrap_or_default();
        if ranked {
            writer.write_record(&[
                row.rank.unwrap_or(0).to_string(),
                row.user.to_string(),
                row.item.to_string(),
                row.score.to_string(),
                rating,
            ])?;
        } else {
            writer.write_record(&[
                row.user.to_string(),
                row.item.to_string(),
                row.score.to_string(),
                rating,
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// Whether a matrix carries explicit or implicit feedback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingType {
    /// Graded ratings on a declared scale.
    Explicit,
    /// Binary interaction signals.
    Implicit,
}

/// Declared properties of one dataset matrix.
#[derive(Clone, Debug)]
pub struct MatrixMeta {
    /// Backing delimited file.
    pub file: PathBuf,
    /// Whether the file carries a fourth timestamp column.
    pub has_timestamp: bool,
    /// Feedback type.
    pub rating_type: RatingType,
    /// Inclusive `(min, max)` rating range.
    pub rating_scale: (f64, f64),
}

/// A named dataset exposing one or more matrices.
#[derive(Clone, Debug)]
pub struct Dataset {
    name: String,
    matrices: BTreeMap<String, MatrixMeta>,
}

impl Dataset {
    /// Creates a dataset with no matrices.
    pub fn new(name: &str) -> Dataset {
        Dataset {
            name: name.to_owned(),
            matrices: BTreeMap::new(),
        }
    }

    /// The dataset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a matrix under a name.
    pub fn with_matrix(mut self, name: &str, meta: MatrixMeta) -> Dataset {
        self.matrices.insert(name.to_owned(), meta);
        self
    }

    /// Looks a matrix up by name.
    pub fn matrix(&self, name: &str) -> Option<&MatrixMeta> {
        self.matrices.get(name)
    }

    /// The matrix names.
    pub fn matrix_names(&self) -> Vec<&str> {
        self.matrices.keys().map(String::as_str).collect()
    }
}

/// Registry of the datasets available to the data stage.
#[derive(Clone, Debug, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, Dataset>,
}

impl DatasetRegistry {
    /// Creates an empty registry.
    pub fn new() -> DatasetRegistry {
        DatasetRegistry {
            datasets: BTreeMap::new(),
        }
    }

    /// Registers a dataset under its own name.
    pub fn add(&mut self, dataset: Dataset) {
        self.datasets.insert(dataset.name().to_owned(), dataset);
    }

    /// Looks a dataset up by name.
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    /// Looks a matrix up by dataset and matrix name.
    pub fn matrix(&self, dataset: &str, matrix: &str) -> Result<&MatrixMeta, CoreError> {
        self.dataset(dataset)
            .ok_or_else(|| CoreError::Logic(format!("unknown dataset '{}'", dataset)))?
            .matrix(matrix)
            .ok_or_else(|| {
                CoreError::Logic(format!(
                    "unknown matrix '{}' in dataset '{}'",
                    matrix, dataset
                ))
            })
    }

    /// The registered dataset names.
    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }

    /// `(dataset, matrix)` pairs of every registered matrix.
    pub fn matrix_pairs(&self) -> Vec<(&str, &str)> {
        self.datasets
            .values()
            .flat_map(|dataset| {
                dataset
                    .matrix_names()
                    .into_iter()
                    .map(move |matrix| (dataset.name(), matrix))
            })
            .collect()
    }
}

/// The immutable value connecting the data stage to the model stage.
#[derive(Clone, Debug)]
pub struct DataTransition {
    /// Source dataset name.
    pub dataset: String,
    /// Source matrix name.
    pub matrix: String,
    /// Directory holding this split's artifacts.
    pub output_dir: PathBuf,
    /// Path of the persisted train set.
    pub train_set_path: PathBuf,
    /// Path of the persisted test set.
    pub test_set_path: PathBuf,
    /// Rating range after conversion.
    pub rating_scale: (f64, f64),
    /// Feedback type after conversion.
    pub rating_type: RatingType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> RatingTable {
        RatingTable::from(vec![
            RatingRow {
                user: 1,
                item: 10,
                rating: 3.5,
                timestamp: Some(100),
            },
            RatingRow {
                user: 2,
                item: 10,
                rating: 1.0,
                timestamp: Some(50),
            },
            RatingRow {
                user: 1,
                item: 11,
                rating: 5.0,
                timestamp: Some(200),
            },
        ])
    }

    #[test]
    fn matrix_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.tsv");

        write_matrix(&path, &sample_table(), true).unwrap();
        let read_back = read_matrix(&path, true).unwrap();

        assert_eq!(read_back.rows(), sample_table().rows());
        assert_eq!(read_back.unique_users(), vec![1, 2]);
        assert_eq!(read_back.unique_items(), vec![10, 11]);
    }

    #[test]
    fn canonical_projection_drops_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train_set.tsv");

        write_matrix(&path, &sample_table(), false).unwrap();
        let read_back = read_matrix(&path, false).unwrap();

        assert_eq!(read_back.len(), 3);
        assert!(read_back.rows().iter().all(|row| row.timestamp.is_none()));
    }

    #[test]
    fn timestamped_output_rejects_rows_without_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.tsv");

        let mut table = sample_table();
        table.push(RatingRow {
            user: 3,
            item: 12,
            rating: 2.0,
            timestamp: None,
        });

        let error = write_matrix(&path, &table, true).unwrap_err();
        assert!(!error.is_resource());
        // Dropping the timestamp column is still fine.
        write_matrix(&path, &table, false).unwrap();
    }

    #[test]
    fn missing_matrix_file_is_a_resource_error() {
        let error = read_matrix(Path::new("/nonexistent/matrix.tsv"), false).unwrap_err();
        assert!(error.is_resource());
    }

    #[test]
    fn result_files_round_trip_with_null_ratings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratings.tsv");

        let rows = vec![
            ResultRow {
                rank: Some(1),
                user: 1,
                item: 10,
                score: 0.9,
                rating: Some(3.5),
            },
            ResultRow {
                rank: Some(2),
                user: 1,
                item: 12,
                score: 0.7,
                rating: None,
            },
        ];
        write_results_with_ratings(&path, &rows).unwrap();
        let read_back = read_results(&path).unwrap();

        assert_eq!(read_back, rows);
    }

    #[test]
    fn registry_reports_unknown_names() {
        let mut registry = DatasetRegistry::new();
        registry.add(Dataset::new("movies").with_matrix(
            "user-movie-rating",
            MatrixMeta {
                file: PathBuf::from("movies.tsv"),
                has_timestamp: false,
                rating_type: RatingType::Explicit,
                rating_scale: (1.0, 5.0),
            },
        ));

        assert!(registry.matrix("movies", "user-movie-rating").is_ok());
        assert!(registry.matrix("movies", "other").is_err());
        assert!(registry.matrix("books", "user-movie-rating").is_err());
        assert_eq!(registry.matrix_pairs(), vec![("movies", "user-movie-rating")]);
    }
}
