//! Built-in datasets for easy testing and experimentation.
use std::collections::BTreeMap;
use std::env;
use std::fs::{create_dir_all, rename, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use csv;
use failure;

#[cfg(feature = "reqwest")]
use reqwest;

use data::{Rating, Ratings};

#[cfg(feature = "reqwest")]
const ML_100K_URL: &str = "http://files.grouplens.org/datasets/movielens/ml-100k/u.data";

/// Dataset error types.
#[derive(Debug, Fail)]
pub enum DatasetError {
    /// Can't find the home directory.
    #[fail(display = "Cannot find home directory.")]
    NoHomeDir,
    /// The ratings file contained no rows.
    #[fail(display = "The ratings file contained no rows.")]
    EmptyFile,
}

#[cfg(feature = "reqwest")]
fn create_data_dir() -> Result<PathBuf, failure::Error> {
    let path = env::home_dir()
        .ok_or_else(|| DatasetError::NoHomeDir)?
        .join(".reco");

    if !path.exists() {
        create_dir_all(&path)?;
    }

    Ok(path)
}

#[cfg(feature = "reqwest")]
fn download(url: &str, dest_filename: &Path) -> Result<PathBuf, failure::Error> {
    let data_dir = create_data_dir()?;
    let desired_filename = data_dir.join(dest_filename);
    let temp_filename = env::temp_dir().join(dest_filename);

    if !desired_filename.exists() {
        let file = File::create(&temp_filename)?;
        let mut writer = BufWriter::new(file);

        let mut response = reqwest::blocking::get(url)?;
        response.copy_to(&mut writer)?;

        rename(temp_filename, &desired_filename)?;
    }

    Ok(desired_filename)
}

fn reindex(rows: Vec<(usize, usize, f32, usize)>) -> Result<Ratings, failure::Error> {
    if rows.is_empty() {
        return Err(DatasetError::EmptyFile.into());
    }

    let mut user_ids = BTreeMap::new();
    let mut item_ids = BTreeMap::new();

    for &(user, item, _, _) in &rows {
        let next_user = user_ids.len();
        user_ids.entry(user).or_insert(next_user);
        let next_item = item_ids.len();
        item_ids.entry(item).or_insert(next_item);
    }

    let ratings: Vec<Rating> = rows
        .into_iter()
        .map(|(user, item, label, timestamp)| {
            Rating::new(user_ids[&user], item_ids[&item], label, timestamp)
        })
        .collect();

    Ok(Ratings::from(ratings))
}

/// Load tab-separated `user item rating timestamp` rows, as shipped in
/// the MovieLens 100K `u.data` file. Ids are reindexed densely in order
/// of first appearance.
pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Ratings, failure::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;

    let rows: Vec<(usize, usize, f32, usize)> =
        reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    reindex(rows)
}

/// Load a comma-separated ratings file with a
/// `user_id,item_id,label,timestamp` header.
pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Ratings, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let ratings: Vec<Rating> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    if ratings.is_empty() {
        return Err(DatasetError::EmptyFile.into());
    }

    Ok(Ratings::from(ratings))
}

/// Download the MovieLens 100K ratings and return them.
///
/// The data is stored in `~/.reco/`.
#[cfg(feature = "reqwest")]
pub fn download_movielens_100k() -> Result<Ratings, failure::Error> {
    let path = download(ML_100K_URL, Path::new("movielens_100k.tsv"))?;

    from_path(path)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_tab_separated_ratings() {
        let path = env::temp_dir().join("reco_test_u.data");
        {
            let mut file = fs::File::create(&path).unwrap();
            writeln!(file, "196\t242\t3\t881250949").unwrap();
            writeln!(file, "186\t302\t3\t891717742").unwrap();
            writeln!(file, "196\t377\t1\t878887116").unwrap();
        }

        let ratings = from_path(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(ratings.len(), 3);
        assert_eq!(ratings.num_users(), 2);
        assert_eq!(ratings.num_items(), 3);

        // First appearance order defines the dense ids.
        assert_eq!(ratings.data()[0].user_id(), 0);
        assert_eq!(ratings.data()[1].user_id(), 1);
        assert_eq!(ratings.data()[2].user_id(), 0);
        assert_eq!(ratings.data()[2].item_id(), 2);
        assert_eq!(ratings.data()[0].label(), 3.0);
    }

    #[test]
    fn empty_file_is_an_error() {
        let path = env::temp_dir().join("reco_test_empty.data");
        fs::File::create(&path).unwrap();

        let result = from_path(&path);
        fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }
}
