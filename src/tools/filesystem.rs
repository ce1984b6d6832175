//! 文件系统工具：fs_list / fs_read / fs_write / fs_search / fs_delete
//!
//! 相对路径按 base_dir 解析，绝对路径原样使用。目录遍历（walkdir）放在 spawn_blocking 中，
//! 条目数受 limit 约束，超出时追加提示行。fs_delete 默认移入 base_dir 下的回收目录。

use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::tools::schema::{args_schema, parse_args};
use crate::tools::{truncate_output, Tool, ToolContext};

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = path.trim();
    if path.is_empty() || path == "." {
        return base.to_path_buf();
    }
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p.strip_prefix("./").unwrap_or(p))
    }
}

fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let unit = ['K', 'M', 'G', 'T', 'P', 'E'][exp.min(5)];
    format!("{:.1} {}B", bytes as f64 / div as f64, unit)
}

fn format_entry(display: &str, meta: &std::fs::Metadata) -> String {
    let (kind, size) = if meta.is_dir() {
        ("d", "[DIR]".to_string())
    } else {
        ("-", format_size(meta.len()))
    };
    let modified = meta
        .modified()
        .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| "????-??-?? ??:??".to_string());
    format!("{kind} {size:<10} | {modified} | {display}\n")
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

fn matches_extension(name: &str, extension: &str) -> bool {
    extension.is_empty() || name.to_lowercase().ends_with(extension)
}

#[derive(Deserialize, JsonSchema)]
struct ListArgs {
    /// Directory to list.
    #[serde(default)]
    path: String,
    /// Walk sub-directories too.
    #[serde(default)]
    recursive: bool,
    /// Include hidden entries such as .git or .env (default false).
    #[serde(default)]
    show_hidden: bool,
    /// Only list files with this extension, e.g. '.rs'. Leave empty for no filter.
    #[serde(default)]
    extension: String,
}

struct ListRequest {
    root: PathBuf,
    recursive: bool,
    show_hidden: bool,
    extension: String,
    limit: usize,
}

fn list_blocking(req: ListRequest) -> Result<String, String> {
    let mut out = format!("DIRECTORY: {}\n", req.root.display());
    if !req.extension.is_empty() {
        out.push_str(&format!("Filter: only '{}' files\n", req.extension));
    }
    out.push_str(&"-".repeat(50));
    out.push('\n');

    let mut count = 0usize;
    let mut truncated = false;
    if req.recursive {
        let walker = WalkDir::new(&req.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| req.show_hidden || !is_hidden(&e.file_name().to_string_lossy()));
        for entry in walker.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy();
            if !entry.file_type().is_dir() && !matches_extension(&name, &req.extension) {
                continue;
            }
            if count >= req.limit {
                truncated = true;
                break;
            }
            if let Ok(meta) = entry.metadata() {
                out.push_str(&format_entry(&entry.path().display().to_string(), &meta));
                count += 1;
            }
        }
    } else {
        let mut entries: Vec<_> = std::fs::read_dir(&req.root)
            .map_err(|e| format!("cannot list {}: {}", req.root.display(), e))?
            .filter_map(Result::ok)
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            if !req.show_hidden && is_hidden(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_dir() && !matches_extension(&name, &req.extension) {
                continue;
            }
            if count >= req.limit {
                truncated = true;
                break;
            }
            out.push_str(&format_entry(&name, &meta));
            count += 1;
        }
    }

    if truncated {
        out.push_str(&format!(
            "\nWARNING: listing stopped at {} entries. Use a narrower path or an 'extension' filter.\n",
            req.limit
        ));
    } else if count == 0 {
        out.push_str("No matching entries.\n");
    }
    Ok(out)
}

/// fs_list 工具
pub struct FsListTool {
    base_dir: PathBuf,
    limit: usize,
}

impl FsListTool {
    pub fn new(base_dir: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl Tool for FsListTool {
    fn name(&self) -> &str {
        "fs_list"
    }

    fn description(&self) -> &str {
        "List a directory with size, modification time and type. Supports recursive walks, hidden entries and an extension filter."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ListArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: ListArgs = parse_args(args)?;
        let root = resolve(&self.base_dir, &args.path);
        if !root.is_dir() {
            return Err(format!("not a directory: {}", root.display()));
        }
        let req = ListRequest {
            root,
            recursive: args.recursive,
            show_hidden: args.show_hidden,
            extension: args.extension.trim().to_lowercase(),
            limit: self.limit,
        };
        tokio::task::spawn_blocking(move || list_blocking(req))
            .await
            .map_err(|e| format!("listing aborted: {e}"))?
    }
}

#[derive(Deserialize, JsonSchema)]
struct ReadArgs {
    /// File to read.
    path: String,
}

/// fs_read 工具：读取文本文件，超长截断
pub struct FsReadTool {
    base_dir: PathBuf,
    max_chars: usize,
}

impl FsReadTool {
    pub fn new(base_dir: impl Into<PathBuf>, max_chars: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_chars,
        }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs_read"
    }

    fn description(&self) -> &str {
        "Read a text file and return its content (long files are truncated)."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ReadArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: ReadArgs = parse_args(args)?;
        let path = resolve(&self.base_dir, &args.path);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(truncate_output(&text, self.max_chars))
    }
}

#[derive(Deserialize, JsonSchema, Default, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
enum WriteMode {
    /// Replace the whole file.
    #[default]
    Overwrite,
    /// Add the content on a new line at the end.
    Append,
    /// Insert the content before the given 1-based line.
    Insert,
}

#[derive(Deserialize, JsonSchema)]
struct WriteArgs {
    /// File to write. Parent directories are created.
    path: String,
    /// Text to write.
    content: String,
    /// overwrite (default), append or insert.
    #[serde(default)]
    mode: WriteMode,
    /// Line number for insert mode (1-based).
    #[serde(default)]
    line: Option<usize>,
}

/// 在第 line 行（1 起）之前插入；越界时夹到首行或末尾
fn insert_at_line(existing: &str, line: usize, content: &str) -> String {
    let mut lines: Vec<&str> = existing.split('\n').collect();
    let at = line.clamp(1, lines.len() + 1) - 1;
    lines.insert(at, content);
    lines.join("\n")
}

/// fs_write 工具
pub struct FsWriteTool {
    base_dir: PathBuf,
}

impl FsWriteTool {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs_write"
    }

    fn description(&self) -> &str {
        "Write text to a file. mode 'overwrite' replaces the file, 'append' adds to the end, 'insert' places the content before 'line'."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<WriteArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: WriteArgs = parse_args(args)?;
        let path = resolve(&self.base_dir, &args.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(format!("cannot read {}: {}", path.display(), e)),
        };
        // 文件不存在时 append / insert 退化为 overwrite
        let (mode, text) = match (args.mode, existing) {
            (WriteMode::Append, Some(old)) => (WriteMode::Append, format!("{old}\n{}", args.content)),
            (WriteMode::Insert, Some(old)) => (
                WriteMode::Insert,
                insert_at_line(&old, args.line.unwrap_or(1), &args.content),
            ),
            _ => (WriteMode::Overwrite, args.content),
        };
        tokio::fs::write(&path, text.as_bytes())
            .await
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        tracing::info!(path = %path.display(), mode = ?mode, bytes = text.len(), "file written");
        Ok(match mode {
            WriteMode::Overwrite => format!("Wrote {} ({} bytes).", path.display(), text.len()),
            WriteMode::Append => format!("Appended to {}.", path.display()),
            WriteMode::Insert => format!(
                "Inserted into {} at line {}.",
                path.display(),
                args.line.unwrap_or(1).max(1)
            ),
        })
    }
}

const MAX_SEARCH_MATCHES: usize = 100;
const BINARY_EXTENSIONS: [&str; 8] = [".exe", ".dll", ".so", ".png", ".jpg", ".zip", ".pdf", ".bin"];

fn default_true() -> bool {
    true
}

#[derive(Deserialize, JsonSchema)]
struct SearchArgs {
    /// Directory to search from.
    #[serde(default)]
    path: String,
    /// Text to look for (case-insensitive).
    query: String,
    /// Treat query as a regular expression.
    #[serde(default)]
    regex: bool,
    /// Search sub-directories too (default true).
    #[serde(default = "default_true")]
    recursive: bool,
    /// Only search files with this extension, e.g. '.rs'.
    #[serde(default)]
    extension: String,
    /// Include hidden files and directories.
    #[serde(default)]
    show_hidden: bool,
}

struct SearchRequest {
    root: PathBuf,
    pattern: Regex,
    query: String,
    recursive: bool,
    show_hidden: bool,
    extension: String,
}

fn search_blocking(req: SearchRequest) -> String {
    let mut out = format!("SEARCH: '{}'\nIn: {}\n{}\n", req.query, req.root.display(), "-".repeat(60));
    let mut matches = 0usize;
    let mut files = 0usize;

    let walker = WalkDir::new(&req.root)
        .max_depth(if req.recursive { usize::MAX } else { 1 })
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || req.show_hidden || !is_hidden(&e.file_name().to_string_lossy()));

    'files: for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !matches_extension(&name, &req.extension) || BINARY_EXTENSIONS.iter().any(|b| name.ends_with(b)) {
            continue;
        }
        let Ok(file) = std::fs::File::open(entry.path()) else {
            continue;
        };
        files += 1;
        let rel = entry.path().strip_prefix(&req.root).unwrap_or(entry.path());
        // 非 UTF-8 行（二进制内容）读到即放弃该文件
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else {
                continue 'files;
            };
            if req.pattern.is_match(&line) {
                if matches >= MAX_SEARCH_MATCHES {
                    break 'files;
                }
                out.push_str(&format!("{} [line {}]:\n   {}\n", rel.display(), idx + 1, line.trim()));
                matches += 1;
            }
        }
    }

    if matches == 0 {
        return format!(
            "No match for '{}' in {} file(s) under {}.",
            req.query,
            files,
            req.root.display()
        );
    }
    out.push_str(&format!("{}\nTotal: {} match(es) in {} file(s) searched.\n", "-".repeat(60), matches, files));
    if matches >= MAX_SEARCH_MATCHES {
        out.push_str(&format!("WARNING: stopped at {MAX_SEARCH_MATCHES} matches.\n"));
    }
    out
}

/// fs_search 工具：按行搜索文件内容（类似 grep）
pub struct FsSearchTool {
    base_dir: PathBuf,
}

impl FsSearchTool {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for FsSearchTool {
    fn name(&self) -> &str {
        "fs_search"
    }

    fn description(&self) -> &str {
        "Search file contents line by line (like grep) and report file, line number and text of every match."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<SearchArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: SearchArgs = parse_args(args)?;
        if args.query.is_empty() {
            return Err("missing parameter: query".to_string());
        }
        let root = resolve(&self.base_dir, &args.path);
        if !root.is_dir() {
            return Err(format!("not a directory: {}", root.display()));
        }
        let source = if args.regex {
            args.query.clone()
        } else {
            regex::escape(&args.query)
        };
        let pattern = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| format!("invalid pattern: {e}"))?;
        let req = SearchRequest {
            root,
            pattern,
            query: args.query,
            recursive: args.recursive,
            show_hidden: args.show_hidden,
            extension: args.extension.trim().to_lowercase(),
        };
        tokio::task::spawn_blocking(move || search_blocking(req))
            .await
            .map_err(|e| format!("search aborted: {e}"))
    }
}

const TRASH_DIR: &str = ".drone_trash";

#[derive(Deserialize, JsonSchema)]
struct DeleteArgs {
    /// File or directory to delete.
    path: String,
    /// Delete for good instead of moving to the trash directory (default false).
    #[serde(default)]
    permanent: bool,
}

/// fs_delete 工具：默认移入回收目录，permanent 时直接删除
pub struct FsDeleteTool {
    base_dir: PathBuf,
}

impl FsDeleteTool {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// 拒绝根目录、工作目录本身、.git 与回收目录
    fn check_protected(&self, path: &Path) -> Result<(), String> {
        let protected = path.parent().is_none()
            || path == self.base_dir
            || self.base_dir.starts_with(path)
            || path.components().any(|c| match c {
                Component::Normal(name) => name == ".git" || name == TRASH_DIR,
                Component::ParentDir => true,
                _ => false,
            });
        if protected {
            return Err(format!("refusing to delete protected path: {}", path.display()));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for FsDeleteTool {
    fn name(&self) -> &str {
        "fs_delete"
    }

    fn description(&self) -> &str {
        "Delete a file or directory. By default it is moved to the .drone_trash directory; set permanent to true to remove it for good."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<DeleteArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: DeleteArgs = parse_args(args)?;
        let path = resolve(&self.base_dir, &args.path);
        self.check_protected(&path)?;
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| format!("cannot delete {}: {}", path.display(), e))?;

        if !args.permanent {
            let trash = self.base_dir.join(TRASH_DIR);
            tokio::fs::create_dir_all(&trash)
                .await
                .map_err(|e| format!("cannot create {}: {}", trash.display(), e))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let target = trash.join(format!("{}_{}", Local::now().timestamp(), file_name));
            tokio::fs::rename(&path, &target)
                .await
                .map_err(|e| format!("cannot move {} to trash: {}", path.display(), e))?;
            tracing::warn!(path = %path.display(), trash = %target.display(), "moved to trash");
            return Ok(format!("Moved {} to {}.", path.display(), target.display()));
        }

        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| format!("cannot delete {}: {}", path.display(), e))?;
        tracing::warn!(path = %path.display(), "deleted permanently");
        let kind = if meta.is_dir() { "Directory" } else { "File" };
        Ok(format!("{kind} {} deleted permanently.", path.display()))
    }
}
