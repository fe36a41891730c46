use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("tuition.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL DEFAULT '',
            dob TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL,
            course TEXT NOT NULL,
            year INTEGER NOT NULL DEFAULT 1,
            enrollment_date TEXT NOT NULL,
            total_fee REAL NOT NULL DEFAULT 0,
            paid_fee REAL NOT NULL DEFAULT 0,
            installments INTEGER NOT NULL DEFAULT 1,
            installment_amt REAL NOT NULL DEFAULT 0,
            installment_dates TEXT NOT NULL DEFAULT '[]',
            fee_status TEXT NOT NULL DEFAULT 'Unpaid',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    // Workspaces created before the fee ledger landed carry identity columns only.
    ensure_students_fee_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_category ON students(category)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_category_course ON students(category, course)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            amount REAL NOT NULL,
            payment_date TEXT NOT NULL,
            method TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_date ON payments(payment_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            subject TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, date, subject)
        )",
        [],
    )?;
    ensure_attendance_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS performance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            exam_name TEXT NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            exam_date TEXT NOT NULL,
            marks REAL NOT NULL,
            total_marks REAL NOT NULL,
            percentage REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, exam_name)
        )",
        [],
    )?;
    ensure_performance_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performance_student ON performance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performance_date ON performance(exam_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            exam_date TEXT NOT NULL,
            category TEXT NOT NULL,
            course TEXT NOT NULL,
            year INTEGER NOT NULL,
            subject TEXT NOT NULL,
            total_marks REAL NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_date ON exams(exam_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            subjects TEXT NOT NULL DEFAULT '[]',
            duration TEXT NOT NULL DEFAULT '',
            fee REAL NOT NULL DEFAULT 0,
            year_min INTEGER NOT NULL DEFAULT 1,
            year_max INTEGER NOT NULL DEFAULT 1,
            UNIQUE(category, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            course TEXT NOT NULL,
            timing TEXT NOT NULL DEFAULT '',
            days TEXT NOT NULL DEFAULT '',
            teacher TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_category ON courses(category)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Early builds wrote fee rows with an empty status. Recompute once.
    backfill_fee_status(&conn)?;

    seed_taxonomy(&conn)?;

    Ok(conn)
}

fn ensure_students_fee_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "total_fee")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN total_fee REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "paid_fee")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN paid_fee REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "installments")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN installments INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "installment_amt")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN installment_amt REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "installment_dates")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN installment_dates TEXT NOT NULL DEFAULT '[]'",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "fee_status")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN fee_status TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    Ok(())
}

fn ensure_attendance_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "attendance", "created_at")? {
        conn.execute(
            "ALTER TABLE attendance ADD COLUMN created_at TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    Ok(())
}

fn ensure_performance_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "performance", "subject")? {
        conn.execute(
            "ALTER TABLE performance ADD COLUMN subject TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    if !table_has_column(conn, "performance", "percentage")? {
        conn.execute(
            "ALTER TABLE performance ADD COLUMN percentage REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "performance", "created_at")? {
        conn.execute(
            "ALTER TABLE performance ADD COLUMN created_at TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    // Rows written before the column existed get the derived value.
    conn.execute(
        "UPDATE performance SET percentage = ROUND(100.0 * marks / total_marks, 1)
         WHERE percentage = 0 AND total_marks > 0 AND marks > 0",
        [],
    )?;
    Ok(())
}

fn backfill_fee_status(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE students SET fee_status = CASE
            WHEN total_fee > 0 AND paid_fee >= total_fee THEN 'Paid'
            WHEN paid_fee > 0 THEN 'Partial'
            ELSE 'Unpaid'
         END
         WHERE fee_status = ''",
        [],
    )?;
    Ok(())
}

/// Category display order, matching the enrolment form dropdown.
pub const CATEGORIES: [&str; 7] = [
    "School (8-10th)",
    "Junior College (11-12th)",
    "Diploma",
    "Degree",
    "JEE",
    "NEET",
    "MHCET",
];

struct CourseSeed {
    category: &'static str,
    name: &'static str,
    subjects: &'static [&'static str],
    duration: &'static str,
    fee: f64,
    year_min: i64,
    year_max: i64,
}

struct BatchSeed {
    name: &'static str,
    course: &'static str,
    timing: &'static str,
    days: &'static str,
    teacher: &'static str,
}

const COURSE_SEEDS: &[CourseSeed] = &[
    CourseSeed {
        category: "School (8-10th)",
        name: "10th Science",
        subjects: &["Physics", "Chemistry", "Biology", "Mathematics"],
        duration: "12 months",
        fee: 15000.0,
        year_min: 10,
        year_max: 10,
    },
    CourseSeed {
        category: "School (8-10th)",
        name: "9th Science",
        subjects: &["Physics", "Chemistry", "Biology", "Mathematics"],
        duration: "12 months",
        fee: 12000.0,
        year_min: 9,
        year_max: 9,
    },
    CourseSeed {
        category: "Junior College (11-12th)",
        name: "12th PCM",
        subjects: &["Physics", "Chemistry", "Mathematics"],
        duration: "12 months",
        fee: 18000.0,
        year_min: 12,
        year_max: 12,
    },
    CourseSeed {
        category: "Junior College (11-12th)",
        name: "11th PCB",
        subjects: &["Physics", "Chemistry", "Biology"],
        duration: "12 months",
        fee: 18000.0,
        year_min: 11,
        year_max: 11,
    },
    CourseSeed {
        category: "JEE",
        name: "JEE Advanced",
        subjects: &["Physics", "Chemistry", "Mathematics"],
        duration: "18 months",
        fee: 25000.0,
        year_min: 1,
        year_max: 2,
    },
    CourseSeed {
        category: "NEET",
        name: "NEET Preparation",
        subjects: &["Physics", "Chemistry", "Biology"],
        duration: "18 months",
        fee: 25000.0,
        year_min: 1,
        year_max: 2,
    },
    CourseSeed {
        category: "MHCET",
        name: "MHCET Engineering",
        subjects: &["Physics", "Chemistry", "Mathematics"],
        duration: "6 months",
        fee: 15000.0,
        year_min: 1,
        year_max: 1,
    },
    CourseSeed {
        category: "Diploma",
        name: "Diploma in Engineering",
        subjects: &["Engineering Mathematics", "Engineering Physics", "Computer Science"],
        duration: "24 months",
        fee: 20000.0,
        year_min: 1,
        year_max: 2,
    },
    CourseSeed {
        category: "Degree",
        name: "B.Sc. Physics",
        subjects: &["Mechanics", "Electromagnetism", "Modern Physics", "Mathematics"],
        duration: "36 months",
        fee: 22000.0,
        year_min: 1,
        year_max: 3,
    },
];

const BATCH_SEEDS: &[BatchSeed] = &[
    BatchSeed {
        name: "Morning Batch - 10th Science",
        course: "10th Science",
        timing: "7:00 AM - 9:00 AM",
        days: "Mon, Wed, Fri",
        teacher: "Rajesh Kumar",
    },
    BatchSeed {
        name: "Evening Batch - 10th Science",
        course: "10th Science",
        timing: "5:00 PM - 7:00 PM",
        days: "Mon, Wed, Fri",
        teacher: "Sneha Sharma",
    },
    BatchSeed {
        name: "Morning Batch - JEE Advanced",
        course: "JEE Advanced",
        timing: "7:00 AM - 10:00 AM",
        days: "Tue, Thu, Sat",
        teacher: "Dr. Vijay Reddy",
    },
    BatchSeed {
        name: "Weekend Batch - NEET",
        course: "NEET Preparation",
        timing: "9:00 AM - 1:00 PM",
        days: "Sat, Sun",
        teacher: "Dr. Arjun Singh",
    },
    BatchSeed {
        name: "Evening Batch - 12th PCM",
        course: "12th PCM",
        timing: "6:00 PM - 8:00 PM",
        days: "Mon to Fri",
        teacher: "Dr. Mohan Singh",
    },
];

// Fresh workspaces start from the standard course catalogue; existing rows win.
fn seed_taxonomy(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM courses", [], |row| row.get(0))?;
    if count == 0 {
        for seed in COURSE_SEEDS {
            let subjects = serde_json::to_string(seed.subjects)?;
            conn.execute(
                "INSERT INTO courses(id, category, name, subjects, duration, fee, year_min, year_max)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    seed.category,
                    seed.name,
                    subjects,
                    seed.duration,
                    seed.fee,
                    seed.year_min,
                    seed.year_max,
                ),
            )?;
        }
    }

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM batches", [], |row| row.get(0))?;
    if count == 0 {
        for seed in BATCH_SEEDS {
            conn.execute(
                "INSERT INTO batches(id, name, course, timing, days, teacher)
                 VALUES (?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    seed.name,
                    seed.course,
                    seed.timing,
                    seed.days,
                    seed.teacher,
                ),
            )?;
        }
    }

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, text),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
