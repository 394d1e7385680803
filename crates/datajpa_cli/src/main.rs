//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify that every repository declaration compiles against the model.
//! - Run one short unit of work and print deterministic output.
//!
//! Usage: `datajpa_cli [db_path]`. Without a path the database lives in
//! memory. Set `DATAJPA_LOG_DIR` to an absolute directory to enable file
//! logging.

use datajpa_core::{
    core_version, default_log_level, init_logging, open_db, open_db_in_memory, session_factory,
    CrudRepository, Managed, Member, OrmConfig, PageRequest, Repositories, Sort, Team,
};
use log::{error, info};
use std::error::Error;
use std::process::ExitCode;

const LOG_DIR_ENV: &str = "DATAJPA_LOG_DIR";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_run module=cli status=error error=\"{err}\"");
            eprintln!("datajpa_cli error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    if let Ok(log_dir) = std::env::var(LOG_DIR_ENV) {
        init_logging(default_log_level(), &log_dir)?;
    }
    println!("datajpa_core version={}", core_version());

    let mut conn = match std::env::args().nth(1) {
        Some(path) => open_db(path)?,
        None => open_db_in_memory()?,
    };
    let factory = session_factory(OrmConfig::default())?;
    let repos = Repositories::new(factory.metamodel())?;
    println!("repositories verified=3");

    let mut session = factory.open_session(&mut conn)?;
    let team = repos.teams.save(&mut session, &Managed::new(Team::new("teamA")))?;
    for (username, age) in [("member1", 10), ("member2", 20), ("member3", 30)] {
        let member = Member::with_team(username, age, &team)?;
        repos.members.save(&mut session, &member)?;
    }

    for dto in repos.members.find_member_dto(&mut session)? {
        println!(
            "member username={} team={}",
            dto.username,
            dto.team_name.as_deref().unwrap_or("-")
        );
    }

    let page = repos.members.find_all_paged(
        &mut session,
        &PageRequest::of(0, 2).with_sort(Sort::desc("age")),
    )?;
    println!(
        "page number={} size={} total_elements={} total_pages={}",
        page.number(),
        page.number_of_elements(),
        page.total_elements(),
        page.total_pages()
    );

    let stats = session.stats();
    session.commit()?;
    info!(
        "event=cli_run module=cli status=ok queries={} inserts={}",
        stats.queries, stats.inserts
    );
    println!("session queries={} inserts={}", stats.queries, stats.inserts);
    Ok(())
}
