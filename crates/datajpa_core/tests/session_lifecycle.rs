use datajpa_core::db::open_db_in_memory;
use datajpa_core::model;
use datajpa_core::orm::Clock;
use datajpa_core::{
    session_factory, CrudRepository, Entity, FlushMode, Managed, Member, OrmConfig, OrmError,
    Repositories, SessionFactory, Team,
};
use rusqlite::Connection;
use std::cell::Cell;
use std::rc::Rc;

/// Advances one second per reading.
struct StepClock {
    now: Cell<i64>,
}

impl Clock for StepClock {
    fn now_millis(&self) -> i64 {
        let next = self.now.get() + 1_000;
        self.now.set(next);
        next
    }
}

#[test]
fn identity_map_returns_one_instance_per_row() {
    let (mut conn, factory, repos) = setup();
    let id = {
        let mut session = factory.open_session(&mut conn).unwrap();
        let member = repos.members.save(&mut session, &Managed::new(Member::new("member1"))).unwrap();
        let id = member.borrow().id().unwrap();
        session.commit().unwrap();
        id
    };

    let mut session = factory.open_session(&mut conn).unwrap();
    let by_id = repos.members.find_by_id(&mut session, id).unwrap().unwrap();
    let by_query = repos.members.find_member_by_username(&mut session, "member1").unwrap();
    let again = session.find::<Member>(id).unwrap().unwrap();
    assert!(by_id.ptr_eq(&by_query));
    assert!(by_id.ptr_eq(&again));
    assert!(session.contains(&by_id));
}

#[test]
fn audit_dates_are_stamped_on_insert_and_update() {
    let mut conn = open_db_in_memory().unwrap();
    let clock = Rc::new(StepClock { now: Cell::new(0) });
    let factory = SessionFactory::new(
        OrmConfig::default(),
        model::metamodel().unwrap(),
        model::listeners(clock),
    );
    let repos = Repositories::new(factory.metamodel()).unwrap();
    let mut session = factory.open_session(&mut conn).unwrap();

    let member = repos.members.save(&mut session, &Managed::new(Member::new("member1"))).unwrap();
    assert_eq!(member.borrow().created_date(), Some(1_000));
    assert_eq!(member.borrow().updated_date(), Some(1_000));

    session.flush().unwrap();
    assert_eq!(member.borrow().updated_date(), Some(1_000));

    member.borrow_mut().set_username("member2");
    session.flush().unwrap();
    assert_eq!(member.borrow().created_date(), Some(1_000));
    assert_eq!(member.borrow().updated_date(), Some(2_000));

    let id = member.borrow().id().unwrap();
    session.clear();
    let reloaded = repos.members.find_by_id(&mut session, id).unwrap().unwrap();
    assert_eq!(reloaded.borrow().created_date(), Some(1_000));
    assert_eq!(reloaded.borrow().updated_date(), Some(2_000));
}

#[test]
fn insert_callbacks_fire_once_per_instance() {
    let mut conn = open_db_in_memory().unwrap();
    let inserts = Rc::new(Cell::new(0));
    let updates = Rc::new(Cell::new(0));
    let mut listeners = model::listeners(Rc::new(datajpa_core::orm::SystemClock));
    let insert_count = Rc::clone(&inserts);
    listeners.on_before_insert::<Member>(move |_| insert_count.set(insert_count.get() + 1));
    let update_count = Rc::clone(&updates);
    listeners.on_before_update::<Member>(move |_| update_count.set(update_count.get() + 1));
    let factory = SessionFactory::new(OrmConfig::default(), model::metamodel().unwrap(), listeners);
    let mut session = factory.open_session(&mut conn).unwrap();

    let member = Managed::new(Member::with_age("member1", 10));
    session.persist(&member).unwrap();
    session.persist(&member).unwrap();
    assert_eq!(inserts.get(), 1);

    session.flush().unwrap();
    assert_eq!(updates.get(), 0);

    member.borrow_mut().set_age(11);
    session.flush().unwrap();
    session.flush().unwrap();
    assert_eq!(updates.get(), 1);
}

#[test]
fn dirty_instance_is_written_once_with_version_bump() {
    let (mut conn, factory, repos) = setup();
    let id = {
        let mut session = factory.open_session(&mut conn).unwrap();
        let member = repos.members.save(&mut session, &Managed::new(Member::with_age("member1", 10))).unwrap();
        assert_eq!(member.borrow().version(), Some(0));
        member.borrow_mut().set_age(11);
        session.flush().unwrap();
        assert_eq!(session.stats().updates, 1);
        assert_eq!(member.borrow().version(), Some(1));
        let id = member.borrow().id().unwrap();
        session.commit().unwrap();
        id
    };

    let (age, version): (i32, i64) = conn
        .query_row(
            "SELECT age, version FROM member WHERE member_id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(age, 11);
    assert_eq!(version, 1);
}

#[test]
fn commit_flush_mode_defers_writes_until_flush() {
    let mut conn = open_db_in_memory().unwrap();
    let factory = session_factory(OrmConfig::default().with_flush_mode(FlushMode::Commit)).unwrap();
    let repos = Repositories::new(factory.metamodel()).unwrap();
    let mut session = factory.open_session(&mut conn).unwrap();

    let member = repos.members.save(&mut session, &Managed::new(Member::with_age("member1", 10))).unwrap();
    member.borrow_mut().set_age(30);
    assert!(repos.members.find_user(&mut session, "member1", 30).unwrap().is_empty());

    session.flush().unwrap();
    assert_eq!(repos.members.find_user(&mut session, "member1", 30).unwrap().len(), 1);
}

#[test]
fn rollback_discards_inserts() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    repos.members.save(&mut session, &Managed::new(Member::new("member1"))).unwrap();
    session.rollback().unwrap();

    let mut session = factory.open_session(&mut conn).unwrap();
    assert_eq!(repos.members.count(&mut session).unwrap(), 0);
}

#[test]
fn removed_instance_is_hidden_and_deleted_on_flush() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let member = repos.members.save(&mut session, &Managed::new(Member::new("member1"))).unwrap();
    let id = member.borrow().id().unwrap();

    session.remove(&member).unwrap();
    assert!(!session.contains(&member));
    assert!(session.find::<Member>(id).unwrap().is_none());

    session.flush().unwrap();
    assert_eq!(session.stats().deletes, 1);
    assert!(session.find::<Member>(id).unwrap().is_none());
}

#[test]
fn persist_cancels_pending_removal() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let member = repos.members.save(&mut session, &Managed::new(Member::new("member1"))).unwrap();

    session.remove(&member).unwrap();
    session.persist(&member).unwrap();
    session.flush().unwrap();
    assert_eq!(session.stats().deletes, 0);
    assert_eq!(repos.members.count(&mut session).unwrap(), 1);
}

#[test]
fn deletes_follow_removal_order() {
    let (mut conn, factory, _repos) = setup();
    {
        let mut session = factory.open_session(&mut conn).unwrap();
        let team = Managed::new(Team::new("teamA"));
        session.persist(&team).unwrap();
        let member = Member::with_team("member1", 10, &team).unwrap();
        session.persist(&member).unwrap();

        session.remove(&member).unwrap();
        session.remove(&team).unwrap();
        session.commit().unwrap();
    }

    let rows: (i64, i64) = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM member), (SELECT COUNT(*) FROM team)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(rows, (0, 0));
}

#[test]
fn cancelled_removal_leaves_the_queue() {
    let (mut conn, factory, _repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let team = Managed::new(Team::new("teamA"));
    session.persist(&team).unwrap();
    let member = Member::with_team("member1", 10, &team).unwrap();
    session.persist(&member).unwrap();

    session.remove(&team).unwrap();
    session.persist(&team).unwrap();
    session.remove(&member).unwrap();
    session.flush().unwrap();
    assert_eq!(session.stats().deletes, 1);
    assert!(session.contains(&team));
    assert!(!session.contains(&member));
}

#[test]
fn evicted_changes_are_never_flushed() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let member = repos.members.save(&mut session, &Managed::new(Member::with_age("member1", 10))).unwrap();
    let id = member.borrow().id().unwrap();

    session.evict(&member).unwrap();
    member.borrow_mut().set_age(99);
    session.flush().unwrap();
    assert_eq!(session.stats().updates, 0);

    let reloaded = session.find::<Member>(id).unwrap().unwrap();
    assert!(!reloaded.ptr_eq(&member));
    assert_eq!(reloaded.borrow().age(), 10);
}

#[test]
fn refresh_discards_in_memory_changes() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let member = repos.members.save(&mut session, &Managed::new(Member::with_age("member1", 10))).unwrap();

    member.borrow_mut().set_username("changed");
    session.refresh(&member).unwrap();
    assert_eq!(member.borrow().username(), "member1");

    session.flush().unwrap();
    assert_eq!(session.stats().updates, 0);
}

#[test]
fn merge_copies_detached_state_onto_managed_instance() {
    let (mut conn, factory, repos) = setup();
    let detached = {
        let mut session = factory.open_session(&mut conn).unwrap();
        let member = repos.members.save(&mut session, &Managed::new(Member::with_age("member1", 10))).unwrap();
        session.commit().unwrap();
        member
    };
    detached.borrow_mut().set_username("renamed");

    let mut session = factory.open_session(&mut conn).unwrap();
    assert!(matches!(
        session.remove(&detached).unwrap_err(),
        OrmError::Detached { .. }
    ));
    let merged = repos.members.save(&mut session, &detached).unwrap();
    assert!(!merged.ptr_eq(&detached));
    assert_eq!(merged.borrow().username(), "renamed");
    assert_eq!(merged.borrow().age(), 10);
    session.commit().unwrap();

    let username: String = conn
        .query_row("SELECT username FROM member", [], |row| row.get(0))
        .unwrap();
    assert_eq!(username, "renamed");
}

#[test]
fn merge_rejects_outdated_detached_version() {
    let (mut conn, factory, repos) = setup();
    let detached = {
        let mut session = factory.open_session(&mut conn).unwrap();
        let member = repos.members.save(&mut session, &Managed::new(Member::with_age("member1", 10))).unwrap();
        session.commit().unwrap();
        member
    };
    conn.execute("UPDATE member SET age = 20, version = version + 1", [])
        .unwrap();

    let mut session = factory.open_session(&mut conn).unwrap();
    let err = session.merge(&detached).unwrap_err();
    assert!(matches!(
        err,
        OrmError::StaleVersion {
            expected_version: Some(0),
            ..
        }
    ));
}

#[test]
fn unsaved_team_reference_is_rejected() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let team = Managed::new(Team::new("teamA"));
    let member = Member::with_team("member1", 10, &team).unwrap();

    let err = repos.members.save(&mut session, &member).unwrap_err();
    assert!(matches!(err, OrmError::TransientReference { relation: "team", .. }));
    assert_eq!(repos.members.count(&mut session).unwrap(), 0);
}

#[test]
fn lazy_team_loads_on_first_access() {
    let (mut conn, factory, repos) = setup();
    let member_id = save_member_with_team(&mut conn, &factory, &repos);

    let mut session = factory.open_session(&mut conn).unwrap();
    let member = repos.members.find_by_id(&mut session, member_id).unwrap().unwrap();
    assert!(member.borrow().team().is_set());
    assert!(!member.borrow().team().is_resolved());

    let before = session.stats().queries;
    let team = member.borrow().team().get(&mut session).unwrap().unwrap();
    assert_eq!(session.stats().queries, before + 1);
    assert_eq!(team.borrow().name(), "teamA");

    let again = member.borrow().team().get(&mut session).unwrap().unwrap();
    assert!(again.ptr_eq(&team));
    assert_eq!(session.stats().queries, before + 1);
}

#[test]
fn fetch_join_and_entity_graph_load_team_in_same_statement() {
    let (mut conn, factory, repos) = setup();
    save_member_with_team(&mut conn, &factory, &repos);

    let mut session = factory.open_session(&mut conn).unwrap();
    let before = session.stats().queries;
    let members = repos.members.find_member_fetch_join(&mut session).unwrap();
    assert_eq!(session.stats().queries, before + 1);
    let member = &members[0];
    assert!(member.borrow().team().is_resolved());
    let team = member.borrow().team().get(&mut session).unwrap().unwrap();
    assert_eq!(team.borrow().name(), "teamA");
    assert_eq!(session.stats().queries, before + 1);

    session.clear();
    for members in [
        repos.members.find_all_with_graph(&mut session).unwrap(),
        repos.members.find_member_entity_graph(&mut session).unwrap(),
        repos
            .members
            .find_entity_graph_by_username(&mut session, "member1")
            .unwrap(),
    ] {
        assert_eq!(members.len(), 1);
        assert!(members[0].borrow().team().is_resolved());
    }
}

#[test]
fn lazy_access_after_session_ends_fails() {
    let (mut conn, factory, repos) = setup();
    let member_id = save_member_with_team(&mut conn, &factory, &repos);

    let member = {
        let mut session = factory.open_session(&mut conn).unwrap();
        let member = repos.members.find_by_id(&mut session, member_id).unwrap().unwrap();
        session.commit().unwrap();
        member
    };

    let mut session = factory.open_session(&mut conn).unwrap();
    let err = member.borrow().team().get(&mut session).unwrap_err();
    assert!(matches!(err, OrmError::DetachedAccess { entity: "Team", .. }));
}

#[test]
fn lazy_access_after_clear_fails() {
    let (mut conn, factory, repos) = setup();
    let member_id = save_member_with_team(&mut conn, &factory, &repos);

    let mut session = factory.open_session(&mut conn).unwrap();
    let member = repos.members.find_by_id(&mut session, member_id).unwrap().unwrap();
    session.clear();
    let err = member.borrow().team().get(&mut session).unwrap_err();
    assert!(matches!(err, OrmError::DetachedAccess { .. }));
}

#[test]
fn read_only_instances_are_never_flushed() {
    let (mut conn, factory, repos) = setup();
    {
        let mut session = factory.open_session(&mut conn).unwrap();
        repos.members.save(&mut session, &Managed::new(Member::new("member1"))).unwrap();
        session.commit().unwrap();
    }

    {
        let mut session = factory.open_session(&mut conn).unwrap();
        let member = repos
            .members
            .find_read_only_by_username(&mut session, "member1")
            .unwrap()
            .unwrap();
        member.borrow_mut().set_username("member2");
        session.flush().unwrap();
        assert_eq!(session.stats().updates, 0);
        session.commit().unwrap();
    }

    let username: String = conn
        .query_row("SELECT username FROM member", [], |row| row.get(0))
        .unwrap();
    assert_eq!(username, "member1");
}

fn setup() -> (Connection, SessionFactory, Repositories) {
    let conn = open_db_in_memory().unwrap();
    let factory = session_factory(OrmConfig::default()).unwrap();
    let repos = Repositories::new(factory.metamodel()).unwrap();
    (conn, factory, repos)
}

fn save_member_with_team(conn: &mut Connection, factory: &SessionFactory, repos: &Repositories) -> i64 {
    let mut session = factory.open_session(conn).unwrap();
    let team = repos.teams.save(&mut session, &Managed::new(Team::new("teamA"))).unwrap();
    let member = Member::with_team("member1", 10, &team).unwrap();
    repos.members.save(&mut session, &member).unwrap();
    let id = member.borrow().id().unwrap();
    session.commit().unwrap();
    id
}
