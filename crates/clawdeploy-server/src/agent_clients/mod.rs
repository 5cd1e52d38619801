pub mod decision_agent;
