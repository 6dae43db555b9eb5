pub const SCHEMA: &str = r#"
-- One row per analysis request; credentials are never stored here
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    prompt_set_id TEXT NOT NULL DEFAULT 'default',
    status TEXT NOT NULL DEFAULT 'pending',  -- pending/processing/completed/failed/needs_password/needs_verification

    -- Results, written only on completion
    phase1_results TEXT,  -- JSON array
    phase2_profile TEXT,  -- JSON object
    image_count INTEGER,
    time_range_start TEXT,
    time_range_end TEXT,
    stats TEXT,           -- JSON object
    used_photos TEXT,     -- JSON array of content hashes

    error_message TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_analysis_jobs_user ON analysis_jobs(user_id);
CREATE INDEX IF NOT EXISTS idx_analysis_jobs_status ON analysis_jobs(status);

-- Content-addressed photo store shared by every user and run
CREATE TABLE IF NOT EXISTS stored_photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    owner_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    captured_at TEXT,

    -- Features
    visual_vector BLOB,
    semantic_vector BLOB,
    aesthetic_score REAL NOT NULL DEFAULT 0,
    information_score REAL NOT NULL DEFAULT 0,
    feature_error TEXT,

    -- Storage
    compression TEXT,     -- JSON CompressionInfo
    compressed_data BLOB,
    original_size INTEGER NOT NULL,
    image_data BLOB NOT NULL,

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Successful Phase 1 results, reused by later runs of the same job
CREATE TABLE IF NOT EXISTS phase1_cache (
    job_id INTEGER NOT NULL,
    batch_id TEXT NOT NULL,
    result TEXT NOT NULL,  -- JSON Phase1Result
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (job_id, batch_id),
    FOREIGN KEY (job_id) REFERENCES analysis_jobs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS prompt_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt_set_id TEXT NOT NULL,
    kind TEXT NOT NULL,  -- phase1/phase2/protagonist
    content TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(prompt_set_id, kind)
);

CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    protagonist_features TEXT,  -- JSON object
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;
