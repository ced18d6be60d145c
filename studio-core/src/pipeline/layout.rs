use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SLUG_LIMIT: usize = 50;

fn transliterate(c: char) -> char {
    match c {
        'ç' => 'c',
        'Ç' => 'C',
        'ğ' => 'g',
        'Ğ' => 'G',
        'ı' => 'i',
        'İ' => 'I',
        'ö' => 'o',
        'Ö' => 'O',
        'ş' => 's',
        'Ş' => 'S',
        'ü' => 'u',
        'Ü' => 'U',
        other => other,
    }
}

/// Filesystem-safe name: Turkish letters folded to ASCII, anything outside
/// `[A-Za-z0-9 _-]` dropped, spaces turned into underscores, at most 50 chars.
pub fn slugify(text: &str) -> String {
    let kept: String = text
        .chars()
        .map(transliterate)
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect();
    let slug: String = kept
        .trim()
        .replace(' ', "_")
        .chars()
        .take(SLUG_LIMIT)
        .collect();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Where one production lives: `<base>/channels/<channel>/<topic>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    channel_slug: String,
    topic_slug: String,
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(base_dir: &Path, channel_slug: &str, topic: &str) -> Self {
        let channel_slug = slugify(channel_slug);
        let topic_slug = slugify(topic);
        let root = base_dir
            .join("channels")
            .join(&channel_slug)
            .join(&topic_slug);
        Self {
            channel_slug,
            topic_slug,
            root,
        }
    }

    pub fn project_name(&self) -> String {
        format!("{}_{}", self.channel_slug, self.topic_slug)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script(&self) -> PathBuf {
        self.root.join("script.txt")
    }

    pub fn story(&self) -> PathBuf {
        self.root.join("story.json")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn audio_file(&self, stem: &str) -> PathBuf {
        self.audio_dir().join(format!("{stem}.wav"))
    }

    pub fn image_file(&self, stem: &str) -> PathBuf {
        self.image_dir().join(format!("{stem}.png"))
    }

    pub fn final_video(&self) -> PathBuf {
        self.root.join("final_video.mp4")
    }

    pub fn temp_clips(&self) -> PathBuf {
        self.root.join("temp_clips")
    }

    pub fn integrity_file(&self) -> PathBuf {
        self.root.join("integrity.json")
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.audio_dir())?;
        fs::create_dir_all(self.image_dir())
    }
}
