use crate::error::UploadError;

/// Video categories assignable through the YouTube Data API (region US).
pub const CATEGORIES: &[(&str, &str)] = &[
    ("Film & Animation", "1"),
    ("Autos & Vehicles", "2"),
    ("Music", "10"),
    ("Pets & Animals", "15"),
    ("Sports", "17"),
    ("Travel & Events", "19"),
    ("Gaming", "20"),
    ("People & Blogs", "22"),
    ("Comedy", "23"),
    ("Entertainment", "24"),
    ("News & Politics", "25"),
    ("Howto & Style", "26"),
    ("Education", "27"),
    ("Science & Technology", "28"),
    ("Nonprofits & Activism", "29"),
];

/// Returns the category id for a category name.
pub fn category_id(name: &str) -> Result<&'static str, UploadError> {
    CATEGORIES
        .iter()
        .find(|(category, _)| *category == name)
        .map(|(_, id)| *id)
        .ok_or_else(|| UploadError::InvalidCategory(name.to_string()))
}

pub fn category_names() -> impl Iterator<Item = &'static str> {
    CATEGORIES.iter().map(|(name, _)| *name)
}
