//! Capture-date extraction and age arithmetic for age-based matching.

use chrono::{DateTime, Datelike, Local, NaiveDate};
use exif::{In, Reader, Tag, Value};
use regex::Regex;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;

const EXIF_DATE_TAGS: [Tag; 3] = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime];
const EARLIEST_PHOTO_YEAR: i32 = 1900;

/// File-name date patterns, tried in order: year-first, then day-first.
static NAME_PATTERNS: OnceLock<[(Regex, bool); 2]> = OnceLock::new();

fn name_patterns() -> &'static [(Regex, bool); 2] {
    NAME_PATTERNS.get_or_init(|| {
        // Literal patterns; compilation cannot fail.
        let year_first = Regex::new(r"(\d{4})[_-]?(\d{2})[_-]?(\d{2})").unwrap();
        let day_first = Regex::new(r"(\d{2})[_-]?(\d{2})[_-]?(\d{4})").unwrap();
        [(year_first, true), (day_first, false)]
    })
}

/// Best-effort capture date: EXIF, then a date in the file name, then mtime.
pub fn photo_date(path: &Path) -> Option<NaiveDate> {
    exif_date(path)
        .or_else(|| filename_date(path))
        .or_else(|| modified_date(path))
}

fn exif_date(path: &Path) -> Option<NaiveDate> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = Reader::new().read_from_container(&mut reader).ok()?;
    EXIF_DATE_TAGS.iter().find_map(|&tag| {
        let field = exif.get_field(tag, In::PRIMARY)?;
        let Value::Ascii(ref parts) = field.value else {
            return None;
        };
        let dt = exif::DateTime::from_ascii(parts.first()?).ok()?;
        NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)
    })
}

/// Date embedded in the file name (`YYYY-MM-DD`, `YYYYMMDD`, `DD-MM-YYYY`, `_` also accepted).
pub fn filename_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let current_year = Local::now().year();

    name_patterns().iter().find_map(|(pattern, year_first)| {
        let caps = pattern.captures(name)?;
        let nums: Vec<u32> = (1..=3)
            .map(|i| caps.get(i).and_then(|m| m.as_str().parse().ok()))
            .collect::<Option<_>>()?;
        let (year, month, day) = if *year_first {
            (nums[0] as i32, nums[1], nums[2])
        } else {
            (nums[2] as i32, nums[1], nums[0])
        };
        if !(EARLIEST_PHOTO_YEAR..=current_year).contains(&year) {
            return None;
        }
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn modified_date(path: &Path) -> Option<NaiveDate> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Local>::from(modified).date_naive())
}

/// Completed years between `birthdate` and `on`; `None` if `on` precedes birth.
pub fn age_on(birthdate: NaiveDate, on: NaiveDate) -> Option<i32> {
    if on < birthdate {
        return None;
    }
    let mut years = on.year() - birthdate.year();
    if (on.month(), on.day()) < (birthdate.month(), birthdate.day()) {
        years -= 1;
    }
    Some(years)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_age_before_and_after_birthday() {
        let birth = date(2010, 5, 15);
        assert_eq!(age_on(birth, date(2020, 5, 14)), Some(9));
        assert_eq!(age_on(birth, date(2020, 5, 15)), Some(10));
        assert_eq!(age_on(birth, date(2010, 5, 15)), Some(0));
        assert_eq!(age_on(birth, date(2009, 1, 1)), None);
    }

    #[test]
    fn test_filename_date_year_first() {
        assert_eq!(
            filename_date(&PathBuf::from("IMG_20190512_123456.jpg")),
            Some(date(2019, 5, 12))
        );
        assert_eq!(
            filename_date(&PathBuf::from("party-2015-07-04.png")),
            Some(date(2015, 7, 4))
        );
    }

    #[test]
    fn test_filename_date_day_first() {
        assert_eq!(
            filename_date(&PathBuf::from("beach 24-12-2018.jpg")),
            Some(date(2018, 12, 24))
        );
    }

    #[test]
    fn test_filename_date_rejects_invalid() {
        assert_eq!(filename_date(&PathBuf::from("IMG_20190231.jpg")), None);
        assert_eq!(filename_date(&PathBuf::from("scan_1850-01-01.jpg")), None);
        assert_eq!(filename_date(&PathBuf::from("holiday.jpg")), None);
    }

    #[test]
    fn test_photo_date_falls_back_to_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-date-here.jpg");
        std::fs::write(&path, b"not exif").unwrap();
        assert_eq!(photo_date(&path), Some(Local::now().date_naive()));
    }
}
