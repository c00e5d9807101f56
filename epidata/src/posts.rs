//! Newline-delimited JSON archives of social-media posts and the image downloads they imply.
//!
//! One JSON object per line. Twitter posts carry `created_at` either as the API string
//! (`Wed Mar 18 14:00:00 +0000 2020`) or, once normalised, as epoch milliseconds. Facebook posts
//! carry `time` in epoch seconds.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::DateTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::download::{DownloadJob, RecordJobs};
use crate::error::EpidataResult;

const TWITTER_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Facebook,
}

/// Parse a Twitter API date into epoch milliseconds.
pub fn parse_twitter_date(value: &str) -> Option<i64> {
    DateTime::parse_from_str(value, TWITTER_DATE_FORMAT)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

impl Platform {
    /// Posts are listed in `<root>/<platform>/posts`, images go to `<root>/<platform>/images`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
        }
    }

    /// Post time in epoch milliseconds.
    pub fn timestamp(&self, post: &Value) -> Option<i64> {
        match self {
            Platform::Twitter => match &post["created_at"] {
                Value::String(s) => parse_twitter_date(s),
                Value::Number(n) => n.as_i64(),
                _ => None,
            },
            Platform::Facebook => post["time"].as_f64().map(|secs| (secs * 1000.0) as i64),
        }
    }

    pub fn post_id(&self, post: &Value) -> Option<String> {
        let value = match self {
            Platform::Twitter => match &post["id_str"] {
                Value::Null => &post["id"],
                id => id,
            },
            Platform::Facebook => &post["post_id"],
        };
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Photo URLs attached to a post, in order.
    pub fn photos(&self, post: &Value) -> Vec<String> {
        let urls: Vec<String> = match self {
            Platform::Twitter => post["entities"]["media"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|media| media["media_url_https"].as_str())
                .filter(|url| url.contains("media"))
                .map(String::from)
                .collect(),
            Platform::Facebook => {
                let has_image = match &post["image"] {
                    Value::Null | Value::Bool(false) => false,
                    Value::String(s) => !s.is_empty(),
                    _ => true,
                };
                if !has_image {
                    return vec![];
                }
                post["images"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|url| url.as_str())
                    .map(String::from)
                    .collect()
            }
        };
        urls
    }

    /// Rewrite string Twitter dates as epoch milliseconds.
    fn normalise(&self, post: &mut Value) {
        if *self != Platform::Twitter {
            return;
        }
        if let Some(created_at) = post["created_at"].as_str() {
            match parse_twitter_date(created_at) {
                Some(ms) => post["created_at"] = Value::from(ms),
                None => warn!("Unparseable created_at '{created_at}'"),
            }
        }
    }
}

/// Read an archive, newest post first. A missing archive is empty.
pub fn load_posts(path: &Path, platform: Platform) -> EpidataResult<Vec<Value>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut posts = vec![];
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut post: Value = serde_json::from_str(&line)?;
        platform.normalise(&mut post);
        posts.push(post);
    }
    posts.sort_by_key(|post| std::cmp::Reverse(platform.timestamp(post).unwrap_or(i64::MIN)));
    debug!("Loaded {} posts from {:?}", posts.len(), path);
    Ok(posts)
}

/// The most recent post of an archive, if any.
pub fn latest_post(path: &Path, platform: Platform) -> EpidataResult<Option<Value>> {
    Ok(load_posts(path, platform)?.into_iter().next())
}

/// Append posts to an archive, one JSON object per line.
pub fn append_posts(path: &Path, posts: &[Value]) -> EpidataResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for post in posts {
        serde_json::to_writer(&mut writer, post)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(posts.len())
}

/// One record per post with photos, each photo saved as `<dir>/<post id>_<idx>.png`.
pub fn image_jobs(posts: &[Value], platform: Platform, dir: &Path) -> Vec<RecordJobs> {
    posts
        .iter()
        .filter_map(|post| {
            let photos = platform.photos(post);
            if photos.is_empty() {
                return None;
            }
            let Some(id) = platform.post_id(post) else {
                warn!("Skipping a {platform} post without an id");
                return None;
            };
            let jobs = photos
                .into_iter()
                .enumerate()
                .map(|(idx, url)| DownloadJob {
                    url,
                    dest: dir.join(format!("{id}_{idx}.png")),
                })
                .collect();
            Some(RecordJobs { record: id, jobs })
        })
        .collect()
}

/// Every `*.json` archive of a directory, sorted by path.
pub fn archives_in(dir: &Path) -> EpidataResult<Vec<std::path::PathBuf>> {
    let mut archives = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Image jobs for an archive, saved under `<images_root>/<archive stem>/`.
pub fn archive_jobs(
    archive: &Path,
    platform: Platform,
    images_root: &Path,
) -> EpidataResult<Vec<RecordJobs>> {
    let posts = load_posts(archive, platform)?;
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(image_jobs(&posts, platform, &images_root.join(stem)))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn tweets() -> Vec<Value> {
        vec![
            json!({
                "id": 1, "id_str": "1",
                "created_at": "Wed Mar 18 14:00:00 +0000 2020",
                "entities": {"media": [
                    {"media_url_https": "https://pbs.twimg.com/media/a.jpg"},
                    {"media_url_https": "https://pbs.twimg.com/ext_tw_video_thumb/b.jpg"}
                ]}
            }),
            json!({
                "id": 2,
                "created_at": "Thu Mar 19 09:30:00 +0000 2020",
                "entities": {"hashtags": []}
            }),
            json!({
                "id": 3, "id_str": "3",
                "created_at": 1584662400000i64,
                "entities": {"media": [{"media_url_https": "https://pbs.twimg.com/media/c.jpg"}]}
            }),
        ]
    }

    #[test]
    fn twitter_dates_should_become_epoch_millis() {
        assert_eq!(
            parse_twitter_date("Wed Mar 18 14:00:00 +0000 2020"),
            Some(1584540000000)
        );
        assert_eq!(parse_twitter_date("2020-03-18"), None);
    }

    #[test]
    fn archives_should_load_newest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("posts").join("minsalud.json");
        assert_eq!(append_posts(&path, &tweets()).unwrap(), 3);

        let posts = load_posts(&path, Platform::Twitter).unwrap();
        let ids: Vec<_> = posts.iter().filter_map(|p| p["id"].as_i64()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(posts[2]["created_at"], json!(1584540000000i64));

        let latest = latest_post(&path, Platform::Twitter).unwrap().unwrap();
        assert_eq!(latest["id"], json!(3));
    }

    #[test]
    fn twitter_photos_should_keep_media_urls_only() {
        let dir = Path::new("images/minsalud");
        let jobs = image_jobs(&tweets(), Platform::Twitter, dir);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].record, "1");
        assert_eq!(
            jobs[0].jobs,
            vec![DownloadJob {
                url: "https://pbs.twimg.com/media/a.jpg".into(),
                dest: dir.join("1_0.png"),
            }]
        );
    }

    #[test]
    fn facebook_posts_should_need_an_image() {
        let posts = vec![
            json!({"post_id": "10", "time": 1584540000.0, "image": "x", "images": ["u0", "u1"]}),
            json!({"post_id": "11", "time": 1584540001.0, "image": null, "images": ["u2"]}),
        ];
        let jobs = image_jobs(&posts, Platform::Facebook, Path::new("img"));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].jobs[1].dest, Path::new("img").join("10_1.png"));
        assert_eq!(Platform::Facebook.timestamp(&posts[0]), Some(1584540000000));
    }

    #[test]
    fn archive_jobs_should_use_the_file_stem() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("minsalud.json");
        append_posts(&archive, &tweets()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(archives_in(dir.path()).unwrap(), vec![archive.clone()]);

        let jobs = archive_jobs(&archive, Platform::Twitter, Path::new("images")).unwrap();
        // newest first
        assert_eq!(jobs[0].jobs[0].dest, Path::new("images/minsalud/3_0.png"));
    }

    #[test]
    fn platforms_should_parse_case_insensitively() {
        assert_eq!(Platform::from_str("Twitter").unwrap(), Platform::Twitter);
        assert_eq!(Platform::Facebook.to_string(), "facebook");
    }
}
